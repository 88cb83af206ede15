use async_trait::async_trait;
use keel_core::Args;
use std::os::unix::fs::PermissionsExt;

use crate::action::{Action, ActionContext, required_str};
use crate::error::ActionError;

/// Parse octal permission bits such as `"0644"`, `"644"` or `"0o600"`.
pub fn parse_mode(mode: &str) -> Option<u32> {
    let trimmed = mode.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 8).ok().filter(|m| *m <= 0o7777)
}

/// Passes when `path` exists.
pub struct FileExists;

#[async_trait]
impl Action for FileExists {
    fn name(&self) -> &str {
        "file.exists"
    }

    fn validate(&self, args: &Args) -> Result<(), ActionError> {
        required_str(args, "path").map(|_| ())
    }

    async fn apply(&self, _ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let path = required_str(args, "path")?;
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(format!("{path} present")),
            Err(e) => Err(ActionError::failed(format!("{path}: {e}"))),
        }
    }
}

/// Passes when `path` has exactly the permission bits in `mode`.
pub struct FileMode;

#[async_trait]
impl Action for FileMode {
    fn name(&self) -> &str {
        "file.mode"
    }

    fn validate(&self, args: &Args) -> Result<(), ActionError> {
        required_str(args, "path")?;
        let mode = required_str(args, "mode")?;
        parse_mode(mode)
            .map(|_| ())
            .ok_or_else(|| ActionError::invalid(format!("mode {mode:?} is not octal")))
    }

    async fn apply(&self, _ctx: &ActionContext, args: &Args) -> Result<String, ActionError> {
        let path = required_str(args, "path")?;
        let mode = required_str(args, "mode")?;
        let want = parse_mode(mode)
            .ok_or_else(|| ActionError::invalid(format!("mode {mode:?} is not octal")))?;
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ActionError::failed(format!("{path}: {e}")))?;
        let have = meta.permissions().mode() & 0o7777;
        if have == want {
            Ok(format!("{path} mode {have:04o}"))
        } else {
            Err(ActionError::failed(format!(
                "{path} mode {have:04o}, want {want:04o}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644"), Some(0o644));
        assert_eq!(parse_mode("600"), Some(0o600));
        assert_eq!(parse_mode("0o755"), Some(0o755));
        assert_eq!(parse_mode("0"), Some(0));
        assert_eq!(parse_mode("0999"), None);
        assert_eq!(parse_mode("rw-r--r--"), None);
        assert_eq!(parse_mode(""), None);
    }

    #[tokio::test]
    async fn test_file_mode_checks_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        std::fs::write(&path, b"secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let ctx = ActionContext::detached();
        let ok = json!({"path": path.to_str().unwrap(), "mode": "0600"});
        let ok = ok.as_object().unwrap();
        assert!(FileMode.validate(ok).is_ok());
        assert!(FileMode.apply(&ctx, ok).await.is_ok());

        let wrong = json!({"path": path.to_str().unwrap(), "mode": "0644"});
        assert!(FileMode.apply(&ctx, wrong.as_object().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_file_exists() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ActionContext::detached();

        assert!(FileExists.validate(&Args::new()).is_err());

        let present = json!({"path": dir.path().to_str().unwrap()});
        assert!(FileExists.apply(&ctx, present.as_object().unwrap()).await.is_ok());

        let missing = json!({"path": dir.path().join("nope").to_str().unwrap()});
        assert!(FileExists.apply(&ctx, missing.as_object().unwrap()).await.is_err());
    }
}

//! Per-service version markers: `<base_dir>/<service>/version`.

use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct VersionMarkers {
    base_dir: PathBuf,
}

impl VersionMarkers {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn marker_path(&self, service: &str) -> PathBuf {
        self.base_dir.join(service.trim()).join("version")
    }

    /// Trimmed marker content. `None` when the marker is missing or blank.
    pub async fn read(&self, service: &str) -> std::io::Result<Option<String>> {
        match tokio::fs::read_to_string(self.marker_path(service)).await {
            Ok(data) => {
                let version = data.trim();
                Ok((!version.is_empty()).then(|| version.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn write(&self, service: &str, version: &str) -> std::io::Result<()> {
        let path = self.marker_path(service);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, format!("{}\n", version.trim())).await
    }
}

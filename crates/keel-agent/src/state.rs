//! Agent state that survives restarts.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Generation of the last plan that reached a terminal state here.
    #[serde(default)]
    pub last_plan_generation: u64,
}

impl AgentState {
    /// Missing file reads as a fresh state.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temp file and rename, so readers never see a torn file.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_missing_then_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        assert_eq!(AgentState::load(&path).unwrap(), AgentState::default());

        let state = AgentState {
            last_plan_generation: 12,
        };
        state.save(&path).await.unwrap();
        assert_eq!(AgentState::load(&path).unwrap(), state);
    }
}

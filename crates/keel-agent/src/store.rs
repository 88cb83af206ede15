//! Plan and status persistence, keyed by node.
//!
//! Statuses are replaced wholesale on every write; nothing here merges.

use async_trait::async_trait;
use keel_core::{NodePlan, NodePlanStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::StoreError;

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn put_current_plan(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError>;
    async fn get_current_plan(&self, node_id: &str) -> Result<Option<NodePlan>, StoreError>;
    async fn put_status(&self, node_id: &str, status: &NodePlanStatus) -> Result<(), StoreError>;
    async fn get_status(&self, node_id: &str) -> Result<Option<NodePlanStatus>, StoreError>;

    /// Keep a copy of `plan` under its generation.
    async fn append_history(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Clone)]
struct NodeRecord {
    current: Option<NodePlan>,
    status: Option<NodePlanStatus>,
    history: BTreeMap<u64, NodePlan>,
}

/// Store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded plans for `node_id`, oldest generation first.
    pub fn history(&self, node_id: &str) -> Vec<NodePlan> {
        self.nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.get(node_id).map(|r| r.history.values().cloned().collect()))
            .unwrap_or_default()
    }

    fn read<T>(&self, node_id: &str, f: impl FnOnce(&NodeRecord) -> Option<T>) -> Result<Option<T>, StoreError> {
        let nodes = self
            .nodes
            .read()
            .map_err(|_| StoreError::Unavailable("plan store poisoned".to_string()))?;
        Ok(nodes.get(node_id).and_then(f))
    }

    fn write(&self, node_id: &str, f: impl FnOnce(&mut NodeRecord)) -> Result<(), StoreError> {
        let mut nodes = self
            .nodes
            .write()
            .map_err(|_| StoreError::Unavailable("plan store poisoned".to_string()))?;
        f(nodes.entry(node_id.to_string()).or_default());
        Ok(())
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    async fn put_current_plan(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError> {
        self.write(node_id, |r| r.current = Some(plan.clone()))
    }

    async fn get_current_plan(&self, node_id: &str) -> Result<Option<NodePlan>, StoreError> {
        self.read(node_id, |r| r.current.clone())
    }

    async fn put_status(&self, node_id: &str, status: &NodePlanStatus) -> Result<(), StoreError> {
        self.write(node_id, |r| r.status = Some(status.clone()))
    }

    async fn get_status(&self, node_id: &str) -> Result<Option<NodePlanStatus>, StoreError> {
        self.read(node_id, |r| r.status.clone())
    }

    async fn append_history(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError> {
        self.write(node_id, |r| {
            r.history.insert(plan.generation, plan.clone());
        })
    }
}

/// JSON files under a root directory:
///
/// ```text
/// <root>/nodes/<node_id>/current.json
/// <root>/nodes/<node_id>/status.json
/// <root>/nodes/<node_id>/history/<generation>.json
/// ```
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    root: PathBuf,
}

impl FilePlanStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_dir(&self, node_id: &str) -> PathBuf {
        self.root.join("nodes").join(node_id)
    }

    fn current_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("current.json")
    }

    fn status_path(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join("status.json")
    }

    fn history_path(&self, node_id: &str, generation: u64) -> PathBuf {
        self.node_dir(node_id)
            .join("history")
            .join(format!("{generation}.json"))
    }
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn put_current_plan(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError> {
        write_json(&self.current_path(node_id), plan).await
    }

    async fn get_current_plan(&self, node_id: &str) -> Result<Option<NodePlan>, StoreError> {
        read_json(&self.current_path(node_id)).await
    }

    async fn put_status(&self, node_id: &str, status: &NodePlanStatus) -> Result<(), StoreError> {
        write_json(&self.status_path(node_id), status).await
    }

    async fn get_status(&self, node_id: &str) -> Result<Option<NodePlanStatus>, StoreError> {
        read_json(&self.status_path(node_id)).await
    }

    async fn append_history(&self, node_id: &str, plan: &NodePlan) -> Result<(), StoreError> {
        write_json(&self.history_path(node_id, plan.generation), plan).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::PlanState;

    fn plan(generation: u64) -> NodePlan {
        NodePlan {
            plan_id: format!("p-{generation}"),
            node_id: "node-a".into(),
            generation,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePlanStore::new(dir.path());

        assert!(store.get_current_plan("node-a").await.unwrap().is_none());
        assert!(store.get_status("node-a").await.unwrap().is_none());

        store.put_current_plan("node-a", &plan(3)).await.unwrap();
        store.append_history("node-a", &plan(3)).await.unwrap();
        let mut status = NodePlanStatus::for_plan(&plan(3), "node-a", 1);
        status.state = PlanState::Running;
        store.put_status("node-a", &status).await.unwrap();

        assert_eq!(store.get_current_plan("node-a").await.unwrap(), Some(plan(3)));
        assert_eq!(store.get_status("node-a").await.unwrap(), Some(status));
        assert!(
            dir.path()
                .join("nodes/node-a/history/3.json")
                .exists()
        );
        assert!(!dir.path().join("nodes/node-a/status.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_status_is_replaced() {
        let store = MemoryPlanStore::new();
        let mut first = NodePlanStatus::for_plan(&plan(1), "node-a", 1);
        first.step_mut("a");
        store.put_status("node-a", &first).await.unwrap();

        let second = NodePlanStatus::for_plan(&plan(2), "node-a", 2);
        store.put_status("node-a", &second).await.unwrap();

        let stored = store.get_status("node-a").await.unwrap().unwrap();
        assert_eq!(stored.generation, 2);
        assert!(stored.steps.is_empty());
    }

    #[tokio::test]
    async fn test_memory_history_ordered() {
        let store = MemoryPlanStore::new();
        for generation in [2, 1, 3] {
            store.append_history("node-a", &plan(generation)).await.unwrap();
        }
        let generations: Vec<u64> = store.history("node-a").iter().map(|p| p.generation).collect();
        assert_eq!(generations, [1, 2, 3]);
        assert!(store.history("node-b").is_empty());
    }
}

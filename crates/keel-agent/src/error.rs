//! Error types for the agent.

use keel_lock::LockError;
use keel_runtime::RunnerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Another holder owns at least one of the plan's locks.
    #[error("LOCK_CONFLICT: {}", .locks.join(", "))]
    LockConflict { locks: Vec<String> },

    /// The lock backend failed; reported under the same prefix as a conflict.
    #[error("LOCK_CONFLICT: {} (lock acquisition failed: {source})", .locks.join(", "))]
    LockUnavailable {
        locks: Vec<String>,
        #[source]
        source: LockError,
    },

    #[error("plan node_id {plan_node:?} does not match this agent ({node_id:?})")]
    ForeignNode { plan_node: String, node_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl DispatchError {
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, Self::LockConflict { .. } | Self::LockUnavailable { .. })
    }
}

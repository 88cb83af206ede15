//! Node plan model.
//!
//! A `NodePlan` is immutable once issued and is identified by
//! `(node_id, plan_id, generation)`. A higher generation for the same node
//! supersedes whatever status the previous generation left behind.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::ConfigError;

/// Untyped action arguments. Each handler validates its own schema.
pub type Args = serde_json::Map<String, serde_json::Value>;

/// What to do once a step has exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureMode {
    #[default]
    Fail,
    Rollback,
}

/// A unit of convergence work issued by the controller for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePlan {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub generation: u64,

    /// Resource keys that must be held while the plan runs.
    #[serde(default)]
    pub locks: Vec<String>,

    #[serde(default)]
    pub spec: PlanSpec,

    #[serde(default)]
    pub policy: PlanPolicy,

    #[serde(default)]
    pub created_ms: u64,

    /// Zero means the plan never expires.
    #[serde(default)]
    pub expires_ms: u64,
}

impl NodePlan {
    /// Load a plan from a JSON or YAML file (chosen by extension, JSON otherwise).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let is_yaml = path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if is_yaml {
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }

    /// Whether the plan has an expiry that lies before `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_ms > 0 && now_ms > self.expires_ms
    }

    /// Lock keys sorted and de-duplicated, with blank entries dropped.
    pub fn sorted_locks(&self) -> Vec<String> {
        let mut locks: Vec<String> = self
            .locks
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        locks.sort();
        locks.dedup();
        locks
    }
}

/// Plan-wide retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPolicy {
    /// Whole-plan attempts beyond the first.
    #[serde(default)]
    pub max_retries: u32,

    /// Linear backoff unit between attempts. Zero selects the runner default.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub failure_mode: FailureMode,
}

/// Imperative steps plus the declarative goal they converge toward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub rollback: Vec<PlanStep>,
    #[serde(default)]
    pub success_probes: Vec<Probe>,
    #[serde(default)]
    pub desired: DesiredState,
}

impl PlanSpec {
    /// True when the plan declares at least one invariant to check.
    pub fn has_invariants(&self) -> bool {
        !self.success_probes.is_empty()
            || !self.desired.services.is_empty()
            || !self.desired.files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,

    /// Registry name of the handler.
    pub action: String,

    #[serde(default)]
    pub args: Args,

    #[serde(default)]
    pub pre: Vec<Condition>,

    #[serde(default)]
    pub post: Vec<Condition>,

    #[serde(default)]
    pub policy: StepPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    #[serde(default)]
    pub max_retries: u32,

    /// Zero disables the per-step timeout.
    #[serde(default)]
    pub timeout_ms: u64,

    #[serde(default)]
    pub on_fail: FailureMode,
}

/// A check resolved through the action registry. Passes iff `apply` succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub args: Args,
}

/// Success probes share the condition shape.
pub type Probe = Condition;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    #[serde(default)]
    pub services: Vec<DesiredService>,
    #[serde(default)]
    pub files: Vec<DesiredFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredService {
    pub name: String,

    /// Systemd unit; falls back to `<name>.service` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    /// Expected content of the service's version marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredFile {
    pub path: String,

    /// Octal permission bits, e.g. "0644".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<String>,
}

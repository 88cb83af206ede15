//! Plan execution status.
//!
//! One `NodePlanStatus` exists per node at a time. It is owned by the runner
//! while a plan executes and is replaced wholesale, never merged, when a new
//! generation arrives.

use serde::{Deserialize, Serialize};

use crate::plan::NodePlan;

/// Plan lifecycle.
///
/// `PENDING -> RUNNING -> {SUCCEEDED | FAILED | ROLLING_BACK -> {ROLLED_BACK | FAILED}} | EXPIRED`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
    Expired,
}

impl PlanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::RolledBack | Self::Expired
        )
    }
}

impl std::fmt::Display for PlanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::RollingBack => write!(f, "ROLLING_BACK"),
            Self::RolledBack => write!(f, "ROLLED_BACK"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    #[default]
    Running,
    Ok,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStatus {
    pub id: String,
    #[serde(default)]
    pub state: StepState,
    #[serde(default)]
    pub attempt: u32,
    /// Last outcome message reported by the handler.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub started_ms: u64,
    #[serde(default)]
    pub finished_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEvent {
    pub ts_ms: u64,
    pub level: EventLevel,
    pub msg: String,
    #[serde(default)]
    pub step_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePlanStatus {
    pub plan_id: String,
    pub node_id: String,
    pub generation: u64,
    #[serde(default)]
    pub state: PlanState,
    #[serde(default)]
    pub started_ms: u64,
    #[serde(default)]
    pub finished_ms: u64,
    #[serde(default)]
    pub current_step_id: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub error_step_id: String,
    #[serde(default)]
    pub steps: Vec<StepStatus>,
    #[serde(default)]
    pub events: Vec<PlanEvent>,
}

impl NodePlanStatus {
    /// Fresh `PENDING` status for `plan`, started at `now_ms`.
    pub fn for_plan(plan: &NodePlan, node_id: &str, now_ms: u64) -> Self {
        let node_id = if plan.node_id.is_empty() {
            node_id.to_string()
        } else {
            plan.node_id.clone()
        };
        Self {
            plan_id: plan.plan_id.clone(),
            node_id,
            generation: plan.generation,
            state: PlanState::Pending,
            started_ms: now_ms,
            ..Default::default()
        }
    }

    /// Whether this status tracks the same `(plan_id, generation)` as `plan`.
    pub fn tracks(&self, plan: &NodePlan) -> bool {
        self.plan_id == plan.plan_id && self.generation == plan.generation
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Step status for `id`, created on first use and reused across retries.
    pub fn step_mut(&mut self, id: &str) -> &mut StepStatus {
        let idx = match self.steps.iter().position(|s| s.id == id) {
            Some(idx) => idx,
            None => {
                self.steps.push(StepStatus {
                    id: id.to_string(),
                    ..Default::default()
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[idx]
    }

    pub fn step(&self, id: &str) -> Option<&StepStatus> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn push_event(
        &mut self,
        ts_ms: u64,
        level: EventLevel,
        msg: impl Into<String>,
        step_id: impl Into<String>,
    ) {
        self.events.push(PlanEvent {
            ts_ms,
            level,
            msg: msg.into(),
            step_id: step_id.into(),
        });
    }
}

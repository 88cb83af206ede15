//! # keel-core
//!
//! Types shared by every keel crate: the `NodePlan` a controller pushes to a
//! node, the `NodePlanStatus` the agent reports back, and the agent's own
//! configuration.
//!
//! A plan carries both an imperative path (`steps` / `rollback`) and a
//! declarative goal (`success_probes` / `desired`). The runtime crate drives
//! the imperative path until the declarative goal holds.

pub mod config;
pub mod plan;
pub mod status;
pub mod time;

pub use config::{AgentConfig, ConfigError};
pub use plan::{
    Args, Condition, DesiredFile, DesiredService, DesiredState, FailureMode, NodePlan, PlanPolicy,
    PlanSpec, PlanStep, Probe, StepPolicy,
};
pub use status::{EventLevel, NodePlanStatus, PlanEvent, PlanState, StepState, StepStatus};
pub use time::{Clock, now_ms, system_clock};

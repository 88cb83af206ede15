//! # keel-runtime
//!
//! The plan runner. `Runner::reconcile_plan` takes a `NodePlan` and whatever
//! status was last recorded for the node and drives the plan's steps, with
//! per-step retries, rollback and whole-plan retries, until the plan's
//! invariants hold or the retry budget runs out.
//!
//! Every state change is appended to the status' event log and handed to a
//! `StatusPublisher` before the runner moves on.

pub mod condition;
pub mod error;
pub mod invariants;
pub mod publisher;
pub mod runner;

pub use condition::evaluate_condition;
pub use error::{ConditionError, InvariantError, RunnerError, StepError};
pub use invariants::InvariantChecker;
pub use publisher::{NoopPublisher, StatusPublisher};
pub use runner::{INVARIANTS_FAILED, Runner};

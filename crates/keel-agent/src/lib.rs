//! # keel-agent
//!
//! The node-side entry point. Plans are submitted into a `PlanStore`, picked
//! up by the poll loop, guarded by resource locks and handed to the runner.
//! Terminal statuses are persisted through the store and reported to the
//! controller.

pub mod dispatcher;
pub mod error;
pub mod publisher;
pub mod state;
pub mod store;
pub mod validate;

pub use dispatcher::{Dispatcher, LOCK_KEY_PREFIX, plan_lock_key};
pub use error::{DispatchError, StoreError};
pub use publisher::StorePublisher;
pub use state::AgentState;
pub use store::{FilePlanStore, MemoryPlanStore, PlanStore};
pub use validate::{PlanIssue, check_plan};

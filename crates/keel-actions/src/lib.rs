//! # keel-actions
//!
//! The pluggable action contract every plan step, condition and success
//! probe runs against.
//!
//! - [`Action`]: `name` / `validate` / `apply` handler SPI
//! - [`ActionRegistry`]: explicit, injected name-keyed handler table
//! - [`Supervisor`]: systemd collaborator used by service actions and the
//!   desired-state invariants
//! - [`VersionMarkers`]: on-disk `<service>/version` files
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keel_actions::{ActionRegistry, SystemctlSupervisor, VersionMarkers, builtin};
//!
//! let mut registry = ActionRegistry::new();
//! builtin::register_builtins(
//!     &mut registry,
//!     Arc::new(SystemctlSupervisor::default()),
//!     VersionMarkers::new("/var/lib/keel/services"),
//! );
//! assert!(registry.get("probe.success").is_some());
//! ```

pub mod action;
pub mod builtin;
pub mod error;
pub mod registry;
pub mod supervisor;
pub mod version;

pub use action::{Action, ActionContext};
pub use error::ActionError;
pub use registry::ActionRegistry;
pub use supervisor::{MemorySupervisor, Supervisor, SystemctlSupervisor, unit_for_service};
pub use version::VersionMarkers;

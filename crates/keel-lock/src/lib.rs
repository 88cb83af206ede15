//! # keel-lock
//!
//! Mutual exclusion for plans that touch the same resources, plus the
//! certificate bundle KV built on the same lease primitive.
//!
//! A lock is a create-if-absent entry keyed by resource, attached to a lease
//! with a TTL. While the holder lives, a background task renews the lease; if
//! the holder crashes the lease simply expires and the key frees itself.

pub mod bundle;
pub mod error;
pub mod lease;
pub mod provider;

pub use bundle::{BundleStore, CertBundle, MemoryBundleStore};
pub use error::LockError;
pub use lease::LeaseLockProvider;
pub use provider::{LockGuard, LockProvider};

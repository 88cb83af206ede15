//! # keel-report
//!
//! Sends `NodePlanStatus` snapshots to the controller. Controllers run as a
//! replicated set; a follower rejects writes with a failed-precondition status
//! whose message names the leader (`leader_addr=<host:port>`). The reporter
//! follows that hint exactly once per send and then sticks to the leader.

pub mod client;
pub mod error;
pub mod http;
pub mod leader;
pub mod reporter;

pub use client::{ControllerClient, ControllerConnector};
pub use error::ReportError;
pub use http::HttpControllerConnector;
pub use leader::leader_addr_from_status;
pub use reporter::StatusReporter;

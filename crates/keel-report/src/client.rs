//! Controller transport seams.

use async_trait::async_trait;
use keel_core::NodePlanStatus;
use std::sync::Arc;

use crate::error::ReportError;

/// One connection to one controller replica.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn report_plan_status(&self, status: &NodePlanStatus) -> Result<(), tonic::Status>;
}

/// Opens clients by endpoint; used again when a follower names the leader.
#[async_trait]
pub trait ControllerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ControllerClient>, ReportError>;
}

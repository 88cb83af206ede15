use async_trait::async_trait;
use keel_core::NodePlanStatus;
use keel_runtime::StatusPublisher;
use std::sync::Arc;

use crate::store::PlanStore;

/// Writes every runner snapshot through to the plan store.
pub struct StorePublisher {
    node_id: String,
    store: Arc<dyn PlanStore>,
}

impl StorePublisher {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn PlanStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }
}

#[async_trait]
impl StatusPublisher for StorePublisher {
    async fn publish(&self, status: &NodePlanStatus) {
        if let Err(e) = self.store.put_status(&self.node_id, status).await {
            tracing::warn!(
                node_id = %self.node_id,
                plan_id = %status.plan_id,
                error = %e,
                "failed to publish plan status"
            );
        }
    }
}

use async_trait::async_trait;
use keel_core::NodePlanStatus;

/// Observer of status snapshots.
///
/// Called after every transition with the full status. Implementations must
/// not fail the run; persistence or transport errors are theirs to log.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, status: &NodePlanStatus);
}

/// Discards every snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl StatusPublisher for NoopPublisher {
    async fn publish(&self, _status: &NodePlanStatus) {}
}

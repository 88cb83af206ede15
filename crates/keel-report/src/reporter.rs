use keel_core::NodePlanStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{ControllerClient, ControllerConnector};
use crate::error::ReportError;
use crate::leader::leader_addr_from_status;

struct Connection {
    endpoint: String,
    client: Option<Arc<dyn ControllerClient>>,
}

/// Status sender with a single leader-redirect retry.
pub struct StatusReporter {
    connector: Arc<dyn ControllerConnector>,
    conn: Mutex<Connection>,
    timeout: Duration,
}

impl StatusReporter {
    pub fn new(connector: Arc<dyn ControllerConnector>, endpoint: impl Into<String>) -> Self {
        Self {
            connector,
            conn: Mutex::new(Connection {
                endpoint: endpoint.into(),
                client: None,
            }),
            timeout: Duration::from_secs(10),
        }
    }

    /// Deadline applied to each individual send.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Endpoint the next send goes to. Follows leader redirects.
    pub fn endpoint(&self) -> String {
        self.conn
            .lock()
            .map(|c| c.endpoint.clone())
            .unwrap_or_default()
    }

    /// Send `status`. A follower rejection naming the leader is retried once
    /// against the leader; every other failure is returned as is.
    pub async fn send_status(&self, status: &NodePlanStatus) -> Result<(), ReportError> {
        let client = self.client().await?;
        let err = match self.send(client.as_ref(), status).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        let Some(leader) = leader_addr_from_status(&err) else {
            return Err(ReportError::Rpc(err));
        };

        tracing::info!(leader = %leader, "controller is a follower; retrying against leader");
        let leader_client = match self.connector.connect(&leader).await {
            Ok(client) => client,
            Err(connect_err) => {
                tracing::warn!(leader = %leader, error = %connect_err, "leader connect failed");
                return Err(ReportError::Rpc(err));
            }
        };
        self.remember(&leader, leader_client.clone());
        self.send(leader_client.as_ref(), status)
            .await
            .map_err(ReportError::Rpc)
    }

    async fn send(
        &self,
        client: &dyn ControllerClient,
        status: &NodePlanStatus,
    ) -> Result<(), tonic::Status> {
        match tokio::time::timeout(self.timeout, client.report_plan_status(status)).await {
            Ok(res) => res,
            Err(_) => Err(tonic::Status::deadline_exceeded(format!(
                "status report timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }

    async fn client(&self) -> Result<Arc<dyn ControllerClient>, ReportError> {
        let endpoint = {
            let conn = self
                .conn
                .lock()
                .map_err(|_| ReportError::NoEndpoint)?;
            if let Some(client) = &conn.client {
                return Ok(client.clone());
            }
            conn.endpoint.clone()
        };
        if endpoint.trim().is_empty() {
            return Err(ReportError::NoEndpoint);
        }
        let client = self.connector.connect(&endpoint).await?;
        self.remember(&endpoint, client.clone());
        Ok(client)
    }

    fn remember(&self, endpoint: &str, client: Arc<dyn ControllerClient>) {
        if let Ok(mut conn) = self.conn.lock() {
            conn.endpoint = endpoint.to_string();
            conn.client = Some(client);
        }
    }
}

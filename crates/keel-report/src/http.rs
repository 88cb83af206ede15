//! JSON-over-HTTP controller transport.
//!
//! `POST {endpoint}/v1/nodes/{node_id}/plan-status` with the status as body.
//! HTTP errors are mapped onto `tonic::Status` codes so the redirect logic
//! treats every transport the same way: 412 is a failed precondition whose
//! body carries the leader hint.

use async_trait::async_trait;
use keel_core::NodePlanStatus;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{ControllerClient, ControllerConnector};
use crate::error::ReportError;

#[derive(Clone)]
pub struct HttpControllerConnector {
    http: reqwest::Client,
}

impl HttpControllerConnector {
    pub fn new(timeout: Duration) -> Result<Self, ReportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReportError::Connect {
                endpoint: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ControllerConnector for HttpControllerConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ControllerClient>, ReportError> {
        let base = base_url(endpoint).ok_or_else(|| ReportError::Connect {
            endpoint: endpoint.to_string(),
            reason: "empty endpoint".to_string(),
        })?;
        Ok(Arc::new(HttpControllerClient {
            http: self.http.clone(),
            base,
        }))
    }
}

struct HttpControllerClient {
    http: reqwest::Client,
    base: String,
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn report_plan_status(&self, status: &NodePlanStatus) -> Result<(), tonic::Status> {
        let url = format!("{}/v1/nodes/{}/plan-status", self.base, status.node_id);
        let response = self
            .http
            .post(&url)
            .json(status)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    tonic::Status::deadline_exceeded(e.to_string())
                } else {
                    tonic::Status::unavailable(e.to_string())
                }
            })?;
        let code = response.status();
        if code.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_for(code, body))
    }
}

/// `host:port` and bare URLs both work; plain addresses get `http://`.
fn base_url(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return None;
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Some(endpoint.to_string())
    } else {
        Some(format!("http://{endpoint}"))
    }
}

fn status_for(code: StatusCode, body: String) -> tonic::Status {
    let message = if body.trim().is_empty() {
        code.to_string()
    } else {
        body
    };
    match code {
        StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
            tonic::Status::failed_precondition(message)
        }
        StatusCode::BAD_REQUEST => tonic::Status::invalid_argument(message),
        StatusCode::UNAUTHORIZED => tonic::Status::unauthenticated(message),
        StatusCode::FORBIDDEN => tonic::Status::permission_denied(message),
        StatusCode::NOT_FOUND => tonic::Status::not_found(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
            tonic::Status::unavailable(message)
        }
        StatusCode::GATEWAY_TIMEOUT => tonic::Status::deadline_exceeded(message),
        _ => tonic::Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leader::leader_addr_from_status;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("ctl:12000").as_deref(), Some("http://ctl:12000"));
        assert_eq!(
            base_url("https://ctl.example/").as_deref(),
            Some("https://ctl.example")
        );
        assert_eq!(base_url("  "), None);
    }

    #[test]
    fn test_precondition_keeps_leader_hint() {
        let status = status_for(
            StatusCode::PRECONDITION_FAILED,
            "not leader (leader_addr=leader:9999)".to_string(),
        );
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
        assert_eq!(
            leader_addr_from_status(&status).as_deref(),
            Some("leader:9999")
        );
        assert_eq!(
            status_for(StatusCode::INTERNAL_SERVER_ERROR, String::new()).code(),
            tonic::Code::Internal
        );
    }
}

//! Outbound calls from the router to worker nodes.
//!
//! [`NodeTransport`] is the seam between routing logic and the network.
//! [`HttpTransport`] talks to the worker agent's HTTP API:
//!
//! - `GET  {address}/api/node/health`: 200 means healthy
//! - `POST {address}/api/node/task`: 2xx means the task was accepted
//!
//! Callers also wrap every call in their own timeout, so an implementation
//! that ignores `timeout` still cannot stall a sweep or a dispatch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::routing::DispatchRequest;

fn accepted_by_default() -> bool {
    true
}

/// Worker's answer to a dispatch. Execution continues asynchronously.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAck {
    #[serde(default = "accepted_by_default")]
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn probe_health(&self, address: &str, timeout: Duration) -> Result<()>;

    async fn dispatch_task(
        &self,
        address: &str,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> Result<DispatchAck>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(source_cloud: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            user_agent: format!("fleet-router/{}", source_cloud),
        })
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn probe_health(&self, address: &str, timeout: Duration) -> Result<()> {
        let url = Self::url(address, "/api/node/health");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            tracing::debug!(url = %url, status = %response.status(), "Health probe returned non-OK");
            Err(FleetError::Transport(format!(
                "health probe returned {}",
                response.status()
            )))
        }
    }

    async fn dispatch_task(
        &self,
        address: &str,
        request: &DispatchRequest,
        timeout: Duration,
    ) -> Result<DispatchAck> {
        let url = Self::url(address, "/api/node/task");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header("X-Priority", request.priority.to_string())
            .header("X-Task-Type", &request.task_type)
            .header("X-Source-Cloud", &request.source_cloud)
            .timeout(timeout)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::Transport(format!("dispatch returned {}", status)));
        }

        // Older agents answer with an empty or non-JSON body.
        let body = response.bytes().await?;
        let ack = serde_json::from_slice::<DispatchAck>(&body).unwrap_or(DispatchAck {
            accepted: true,
            message: None,
        });
        Ok(ack)
    }
}

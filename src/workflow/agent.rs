use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::WorkflowError;

/// Request timeout for the replicate call. The agent acknowledges and then
/// streams asynchronously, so this bounds only the handshake.
const AGENT_TIMEOUT: Duration = Duration::from_secs(30);

/// One NBD endpoint the agent should stream a disk into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdTarget {
    /// `nbd://host:port/export-name`
    pub device_path: String,
    pub vmware_disk_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_change_id: Option<String>,
}

/// The replicate RPC body sent to the hypervisor-side capture agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRequest {
    pub job_id: String,
    pub vcenter: String,
    pub username: String,
    pub password: String,
    pub vm_paths: Vec<String>,
    /// Base URL the agent calls back into for per-disk completion
    pub oma_url: String,
    pub nbd_targets: Vec<NbdTarget>,
}

/// The hypervisor-side process that reads VM disks with changed-block
/// tracking and writes them into our NBD exports.
#[async_trait]
pub trait CaptureAgent: Send + Sync {
    /// Kick off streaming for every disk of a job. The agent completes each
    /// disk independently and calls back per disk.
    async fn replicate(&self, request: &ReplicationRequest) -> Result<(), WorkflowError>;

    /// Best-effort cancel of a running job on the agent side.
    async fn cancel(&self, job_id: &str);
}

/// HTTP/JSON client for the capture agent.
pub struct CaptureAgentClient {
    base_url: String,
    client: reqwest::Client,
}

impl CaptureAgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(AGENT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl CaptureAgent for CaptureAgentClient {
    async fn replicate(&self, request: &ReplicationRequest) -> Result<(), WorkflowError> {
        let url = format!("{}/replicate", self.base_url.trim_end_matches('/'));
        info!(
            "Triggering capture agent for job {} ({} disks)",
            request.job_id,
            request.nbd_targets.len()
        );

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| WorkflowError::AgentUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::AgentUnreachable(format!(
                "agent returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }

    async fn cancel(&self, job_id: &str) {
        let url = format!("{}/cancel/{}", self.base_url.trim_end_matches('/'), job_id);
        if let Err(e) = self.client.post(&url).send().await {
            warn!("Best-effort agent cancel for job {} failed: {}", job_id, e);
        }
    }
}

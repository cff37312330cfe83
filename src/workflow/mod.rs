use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainError;
use crate::export::ExportError;
use crate::models::backup::BackupType;
use crate::repository::RepositoryError;
use crate::tracker::TrackerError;

pub mod agent;
pub mod engine;

pub use agent::{CaptureAgent, CaptureAgentClient};
pub use engine::BackupWorkflowEngine;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid backup request: {0}")]
    Validation(String),

    #[error("Parent backup missing: {0}")]
    ParentMissing(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capture agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// One disk of the VM to capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRequest {
    pub disk_index: i64,
    /// The hypervisor's identifier for the disk (e.g. VMware disk key "2000")
    pub source_disk_key: String,
    pub size_bytes: i64,
    /// Required for incrementals: the changed-block marker of the previous
    /// backup of this disk
    #[serde(default)]
    pub previous_change_id: Option<String>,
}

/// Hypervisor endpoint and credentials handed through to the capture agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorTarget {
    pub vcenter: String,
    pub username: String,
    pub password: String,
    pub vm_path: String,
}

/// A complete backup invocation for one VM.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub vm_name: String,
    pub repository_id: i64,
    pub backup_type: BackupType,
    pub hypervisor: HypervisorTarget,
    pub disks: Vec<DiskRequest>,
}

/// Per-disk export details returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct DiskExport {
    pub disk_index: i64,
    pub image_path: String,
    pub port: u16,
    pub export_name: String,
    pub nbd_url: String,
}

/// What a successfully started backup job looks like to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct BackupJobStarted {
    pub job_id: i64,
    pub context_id: i64,
    pub backup_type: BackupType,
    pub disks: Vec<DiskExport>,
}

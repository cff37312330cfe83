use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One per (VM, repository) pair; persists across backups.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupContext {
    pub id: i64,
    pub vm_name: String,
    pub repository_id: i64,
    pub created_at: DateTime<Utc>,
    pub successful_count: i64,
    pub last_backup_id: Option<i64>,
    pub last_backup_type: Option<String>,
    pub last_backup_at: Option<DateTime<Utc>>,
}

/// A single backup invocation covering all disks of one VM.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: i64,
    pub context_id: i64,
    pub vm_name: String,
    pub backup_type: String, // enum: 'full', 'incremental'
    pub status: String,      // enum: 'pending', 'running', 'completed', 'failed', 'cancelled'
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Authoritative when set by telemetry, otherwise aggregated from disks
    pub bytes_transferred: i64,
    pub error_message: Option<String>,
}

/// One per VM disk within a backup job.
///
/// `change_id` is the opaque changed-block marker returned by the hypervisor
/// and is only ever set on completed disks. `chain_id` is set when the disk
/// is appended to its chain after job completion.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupDisk {
    pub id: i64,
    pub job_id: i64,
    pub chain_id: Option<i64>,
    pub disk_index: i64,
    pub source_disk_key: String,
    pub image_path: String,
    pub change_id: Option<String>,
    pub parent_image_path: Option<String>,
    pub size_bytes: i64,
    pub bytes_transferred: i64,
    pub status: String, // enum: 'pending', 'running', 'completed', 'failed'
    pub completed_at: Option<DateTime<Utc>>,
}

/// Backup kind requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(format!("unknown backup type: {}", other)),
        }
    }
}

pub mod job_status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | FAILED | CANCELLED)
    }
}

pub mod disk_status {
    pub const PENDING: &str = "pending";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_type_round_trips_through_str() {
        assert_eq!(BackupType::from_str("full").unwrap(), BackupType::Full);
        assert_eq!(
            BackupType::from_str("incremental").unwrap(),
            BackupType::Incremental
        );
        assert!(BackupType::from_str("differential").is_err());
        assert_eq!(BackupType::Incremental.as_str(), "incremental");
    }

    #[test]
    fn terminal_statuses() {
        assert!(job_status::is_terminal(job_status::COMPLETED));
        assert!(job_status::is_terminal(job_status::CANCELLED));
        assert!(!job_status::is_terminal(job_status::RUNNING));
        assert!(!job_status::is_terminal(job_status::PENDING));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution-side job record, separate from the backup business rows.
///
/// Tracker rows model the run itself (orchestration steps, progress,
/// panics) and carry an optional caller-supplied external id for
/// correlation with UIs and schedulers.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TrackedJob {
    pub id: i64,
    pub external_id: Option<String>,
    pub context_id: Option<String>,
    pub parent_job_id: Option<i64>,
    pub job_type: String,
    pub operation: String,
    pub owner: Option<String>,
    pub category: Option<String>,
    pub status: String, // enum: 'running', 'completed', 'failed', 'cancelled'
    pub percent_complete: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// A step within a tracked job, auto-sequenced by a per-job counter.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TrackedStep {
    pub id: i64,
    pub job_id: i64,
    pub seq: i64,
    pub name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// A structured log record correlated to a job (and optionally a step).
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct TrackedLog {
    pub id: i64,
    pub job_id: Option<i64>,
    pub step_id: Option<i64>,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub mod tracked_status {
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const CANCELLED: &str = "cancelled";

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | FAILED | CANCELLED)
    }
}

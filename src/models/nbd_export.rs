use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ephemeral per-backup record coupling a backup disk to its NBD export
/// (port, export name, image-server PID). Lives only while the disk is
/// being written; persisted so a restarted service can reconcile orphans.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct NbdExport {
    pub id: i64,
    pub job_id: i64,
    pub backup_disk_id: i64,
    pub port: i64,
    pub export_name: String,
    pub pid: Option<i64>,
    pub created_at: DateTime<Utc>,
}

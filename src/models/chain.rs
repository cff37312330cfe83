use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per (backup context, disk index): a chronologically ordered sequence
/// of backup disks with one full at the root and a `latest` head pointer.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct BackupChain {
    pub id: i64,
    pub context_id: i64,
    pub disk_index: i64,
    /// The chain's root (a completed full backup disk)
    pub full_backup_id: i64,
    /// The chain's head (the most recently completed member)
    pub latest_backup_id: i64,
    pub total_backups: i64,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

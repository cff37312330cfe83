use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A read-only mount of a single backup disk, backed by a kernel NBD device.
///
/// Rows are deleted on unmount, so the UNIQUE constraint on
/// `backup_disk_id` is what enforces at most one active mount per disk.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RestoreMount {
    /// Opaque mount id (UUID v4)
    pub id: String,
    pub backup_disk_id: i64,
    pub mount_path: String,
    pub nbd_device: String,
    pub filesystem_type: Option<String>,
    pub status: String, // enum: 'mounting', 'mounted', 'unmounting', 'failed'
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub mod mount_status {
    pub const MOUNTING: &str = "mounting";
    pub const MOUNTED: &str = "mounted";
    pub const UNMOUNTING: &str = "unmounting";
    pub const FAILED: &str = "failed";
}

impl RestoreMount {
    /// Whether the mount should be collected by the cleanup sweep.
    pub fn is_expired(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        self.expires_at < now || self.last_accessed_at + idle_timeout < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn mount(last_access_mins_ago: i64, expires_in_mins: i64) -> RestoreMount {
        let now = Utc::now();
        RestoreMount {
            id: "m-1".into(),
            backup_disk_id: 1,
            mount_path: "/mnt/omni-vault/restore/m-1".into(),
            nbd_device: "/dev/nbd0".into(),
            filesystem_type: Some("ntfs".into()),
            status: mount_status::MOUNTED.into(),
            created_at: now - Duration::minutes(last_access_mins_ago),
            last_accessed_at: now - Duration::minutes(last_access_mins_ago),
            expires_at: now + Duration::minutes(expires_in_mins),
        }
    }

    #[test]
    fn fresh_mount_is_not_expired() {
        let m = mount(0, 60);
        assert!(!m.is_expired(Utc::now(), Duration::minutes(30)));
    }

    #[test]
    fn idle_mount_is_expired() {
        let m = mount(31, 60);
        assert!(m.is_expired(Utc::now(), Duration::minutes(30)));
    }

    #[test]
    fn ttl_overrides_recent_access() {
        let m = mount(0, -1);
        assert!(m.is_expired(Utc::now(), Duration::minutes(30)));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named storage location for backup images.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub repo_type: String, // enum: 'local', 'nfs', 'object'
    /// Driver-specific configuration as JSON (root path, NFS export, ...)
    pub config: String,
    pub enabled: bool,
    pub min_retention_days: Option<i64>,
    pub grace_period_days: Option<i64>,
    pub apply_to_full_backups: bool,
    pub apply_to_incrementals: bool,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
    pub created_at: DateTime<Utc>,
}

/// Driver-specific settings parsed out of `Repository::config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Local root directory under which images are stored
    pub root: String,
    /// NFS only: remote export in `host:/path` form
    #[serde(default)]
    pub nfs_export: Option<String>,
    /// NFS only: extra mount options passed to mount(8)
    #[serde(default)]
    pub nfs_options: Option<String>,
}

/// Immutability policy attached to a repository, when configured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImmutabilityPolicy {
    pub min_retention_days: i64,
    pub grace_period_days: i64,
    pub apply_to_full_backups: bool,
    pub apply_to_incrementals: bool,
}

impl Repository {
    /// Parses the driver-specific configuration JSON.
    pub fn parse_config(&self) -> Result<RepositoryConfig, serde_json::Error> {
        serde_json::from_str(&self.config)
    }

    /// The immutability policy, if one is configured.
    pub fn immutability_policy(&self) -> Option<ImmutabilityPolicy> {
        self.min_retention_days.map(|min| ImmutabilityPolicy {
            min_retention_days: min,
            grace_period_days: self.grace_period_days.unwrap_or(0),
            apply_to_full_backups: self.apply_to_full_backups,
            apply_to_incrementals: self.apply_to_incrementals,
        })
    }
}

pub mod repo_type {
    pub const LOCAL: &str = "local";
    pub const NFS: &str = "nfs";
    pub const OBJECT: &str = "object";
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::image::ImageError;

pub mod immutability;
pub mod local;
pub mod manager;
pub mod nfs;
pub mod object;

pub use immutability::ImmutabilityGuard;
pub use local::LocalBackend;
pub use manager::RepositoryManager;
pub use nfs::NfsBackend;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Repository not found: {0}")]
    NotFound(String),

    #[error("Repository {0} is disabled")]
    Disabled(i64),

    #[error("Insufficient space in repository: {0}")]
    InsufficientSpace(String),

    #[error("Backup is retention-locked until {0}")]
    RetentionLocked(DateTime<Utc>),

    #[error("Repository still referenced by {0} backups")]
    DependencyPresent(i64),

    #[error("Unsupported repository operation: {0}")]
    Unsupported(String),

    #[error("Invalid repository config: {0}")]
    Config(String),

    #[error("Mount failure: {0}")]
    Mount(String),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Point-in-time capacity snapshot of a repository's storage medium.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StorageInfo {
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub available_bytes: i64,
}

/// Everything a backend needs to lay down the image file for one backup disk.
#[derive(Debug, Clone)]
pub struct BackupImageSpec {
    pub context_id: i64,
    pub disk_index: i64,
    pub backup_id: i64,
    pub backup_type: String,
    pub size_bytes: i64,
    /// Present for incrementals: the chain head's image
    pub parent_image_path: Option<PathBuf>,
}

/// Metadata the delete path needs to make retention decisions.
#[derive(Debug, Clone)]
pub struct BackupFileMeta {
    pub image_path: PathBuf,
    pub backup_type: String,
    pub created_at: DateTime<Utc>,
}

/// Persistent storage abstraction for backup images.
///
/// Backends deal exclusively with the storage medium; row bookkeeping stays
/// in the query layer and composition stays in [`manager::RepositoryManager`].
#[async_trait]
pub trait RepositoryBackend: Send + Sync {
    /// The repository row this backend serves.
    fn repository_id(&self) -> i64;

    /// Where the image for a given backup lives on this medium.
    fn image_path(&self, context_id: i64, disk_index: i64, backup_id: i64) -> PathBuf;

    /// Allocate the on-disk image for a new backup and return its path.
    /// Out-of-space failures remove the partial file before returning.
    async fn create_backup(&self, spec: &BackupImageSpec) -> Result<PathBuf, RepositoryError>;

    /// Remove a backup image from the medium.
    async fn delete_backup(&self, meta: &BackupFileMeta) -> Result<(), RepositoryError>;

    /// Capacity snapshot of the underlying medium.
    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError>;
}

/// Capacity probe shared by the filesystem-backed backends.
///
/// `df` is POSIX and already understands every medium we mount, which keeps
/// the probe identical for local directories and NFS mounts.
pub(crate) async fn probe_storage(path: &Path) -> Result<StorageInfo, RepositoryError> {
    let output = tokio::process::Command::new("df")
        .arg("-B1")
        .arg("--output=size,used,avail")
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(RepositoryError::Mount(format!(
            "df failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .nth(1)
        .ok_or_else(|| RepositoryError::Mount(format!("df produced no data for {}", path.display())))?;
    let mut fields = line.split_whitespace();

    let mut next = || -> Result<i64, RepositoryError> {
        fields
            .next()
            .and_then(|f| f.parse::<i64>().ok())
            .ok_or_else(|| RepositoryError::Mount(format!("unparseable df output: {}", line)))
    };

    Ok(StorageInfo {
        total_bytes: next()?,
        used_bytes: next()?,
        available_bytes: next()?,
    })
}

use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::image::ImageDriver;

use super::{BackupFileMeta, BackupImageSpec, LocalBackend, RepositoryBackend, RepositoryError, StorageInfo};

/// Network-filesystem repository backend.
///
/// Composes the local backend with a mount manager: before any operation it
/// ensures the remote export is mounted at the configured local point. The
/// check is idempotent against externally pre-mounted paths, and the backend
/// never unmounts, since operations may be in flight from other tasks.
pub struct NfsBackend {
    inner: LocalBackend,
    export: String,
    mount_point: PathBuf,
    mount_options: Option<String>,
    /// Serializes mount attempts so two first-users don't race mount(8)
    mount_lock: Mutex<()>,
}

impl NfsBackend {
    pub fn new(
        repository_id: i64,
        mount_point: impl Into<PathBuf>,
        export: impl Into<String>,
        mount_options: Option<String>,
        driver: Arc<dyn ImageDriver>,
    ) -> Self {
        let mount_point = mount_point.into();
        Self {
            inner: LocalBackend::new(repository_id, mount_point.clone(), driver),
            export: export.into(),
            mount_point,
            mount_options,
            mount_lock: Mutex::new(()),
        }
    }

    /// Whether the mount point currently appears in the kernel mount table.
    async fn is_mounted(&self) -> Result<bool, RepositoryError> {
        let mounts = tokio::fs::read_to_string("/proc/mounts").await?;
        let needle = self.mount_point.display().to_string();
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|point| point == needle))
    }

    async fn ensure_mounted(&self) -> Result<(), RepositoryError> {
        let _guard = self.mount_lock.lock().await;

        if self.is_mounted().await? {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.mount_point).await?;

        let mut command = tokio::process::Command::new("mount");
        command.arg("-t").arg("nfs");
        if let Some(options) = &self.mount_options {
            command.arg("-o").arg(options);
        }
        command.arg(&self.export).arg(&self.mount_point);

        let output = command.output().await?;
        if !output.status.success() {
            return Err(RepositoryError::Mount(format!(
                "mount {} at {} failed: {}",
                self.export,
                self.mount_point.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!("Mounted {} at {}", self.export, self.mount_point.display());
        Ok(())
    }
}

#[async_trait]
impl RepositoryBackend for NfsBackend {
    fn repository_id(&self) -> i64 {
        self.inner.repository_id()
    }

    fn image_path(&self, context_id: i64, disk_index: i64, backup_id: i64) -> PathBuf {
        self.inner.image_path(context_id, disk_index, backup_id)
    }

    async fn create_backup(&self, spec: &BackupImageSpec) -> Result<PathBuf, RepositoryError> {
        self.ensure_mounted().await?;
        self.inner.create_backup(spec).await
    }

    async fn delete_backup(&self, meta: &BackupFileMeta) -> Result<(), RepositoryError> {
        self.ensure_mounted().await?;
        self.inner.delete_backup(meta).await
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        self.ensure_mounted().await?;
        self.inner.storage_info().await
    }
}

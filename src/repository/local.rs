use async_trait::async_trait;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use crate::image::ImageDriver;

use super::{probe_storage, BackupFileMeta, BackupImageSpec, RepositoryBackend, RepositoryError, StorageInfo};

/// Free-space floor below which new backups are refused outright. Copy-on-
/// write images are thin, so this is a guard rail rather than a reservation.
const MIN_FREE_BYTES: i64 = 1 << 30;

/// Local-directory repository backend.
///
/// Layout: `{root}/ctx-{context_id}/disk-{index}/{backup_id}.qcow2`
pub struct LocalBackend {
    repository_id: i64,
    root: PathBuf,
    driver: Arc<dyn ImageDriver>,
}

impl LocalBackend {
    pub fn new(repository_id: i64, root: impl Into<PathBuf>, driver: Arc<dyn ImageDriver>) -> Self {
        Self {
            repository_id,
            root: root.into(),
            driver,
        }
    }

}

#[async_trait]
impl RepositoryBackend for LocalBackend {
    fn repository_id(&self) -> i64 {
        self.repository_id
    }

    fn image_path(&self, context_id: i64, disk_index: i64, backup_id: i64) -> PathBuf {
        self.root
            .join(format!("ctx-{}", context_id))
            .join(format!("disk-{}", disk_index))
            .join(format!("{}.qcow2", backup_id))
    }

    async fn create_backup(&self, spec: &BackupImageSpec) -> Result<PathBuf, RepositoryError> {
        // The probe is advisory; actual out-of-space still surfaces from the
        // image driver below and rolls back the partial file.
        match self.storage_info().await {
            Ok(info) if info.available_bytes < MIN_FREE_BYTES => {
                return Err(RepositoryError::InsufficientSpace(format!(
                    "{} bytes available in {}",
                    info.available_bytes,
                    self.root.display()
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("Capacity probe for {} failed: {}", self.root.display(), e),
        }

        let path = self.image_path(spec.context_id, spec.disk_index, spec.backup_id);
        let result = match &spec.parent_image_path {
            Some(parent) => self.driver.create_incremental(&path, parent).await,
            None => self.driver.create_full(&path, spec.size_bytes).await,
        };

        if let Err(e) = result {
            // Roll back the partial file so a half-written header can never
            // be mistaken for a restorable image.
            if path.exists() {
                if let Err(rm) = tokio::fs::remove_file(&path).await {
                    warn!("Failed to remove partial image {}: {}", path.display(), rm);
                }
            }
            let message = e.to_string();
            return Err(if message.contains("No space left") {
                RepositoryError::InsufficientSpace(message)
            } else {
                RepositoryError::Image(e)
            });
        }

        info!(
            "Created backup image {} ({} bytes logical)",
            path.display(),
            spec.size_bytes
        );
        Ok(path)
    }

    async fn delete_backup(&self, meta: &BackupFileMeta) -> Result<(), RepositoryError> {
        self.driver.delete_if_leaf(&meta.image_path).await?;
        info!("Deleted backup image {}", meta.image_path.display());
        Ok(())
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        tokio::fs::create_dir_all(&self.root).await?;
        probe_storage(&self.root).await
    }
}

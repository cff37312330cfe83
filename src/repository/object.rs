use async_trait::async_trait;
use std::path::PathBuf;

use super::{BackupFileMeta, BackupImageSpec, RepositoryBackend, RepositoryError, StorageInfo};

/// Object-store repository backend.
///
/// Not part of the core: the contract is stubbed so repository rows of this
/// type can exist (for forward compatibility of configs) without any
/// operation succeeding against them.
pub struct ObjectBackend {
    repository_id: i64,
}

impl ObjectBackend {
    pub fn new(repository_id: i64) -> Self {
        Self { repository_id }
    }

    fn unsupported<T>(&self, operation: &str) -> Result<T, RepositoryError> {
        Err(RepositoryError::Unsupported(format!(
            "object-store repository {}: {}",
            self.repository_id, operation
        )))
    }
}

#[async_trait]
impl RepositoryBackend for ObjectBackend {
    fn repository_id(&self) -> i64 {
        self.repository_id
    }

    fn image_path(&self, context_id: i64, disk_index: i64, backup_id: i64) -> PathBuf {
        PathBuf::from(format!(
            "object://{}/ctx-{}/disk-{}/{}.qcow2",
            self.repository_id, context_id, disk_index, backup_id
        ))
    }

    async fn create_backup(&self, _spec: &BackupImageSpec) -> Result<PathBuf, RepositoryError> {
        self.unsupported("create_backup")
    }

    async fn delete_backup(&self, _meta: &BackupFileMeta) -> Result<(), RepositoryError> {
        self.unsupported("delete_backup")
    }

    async fn storage_info(&self) -> Result<StorageInfo, RepositoryError> {
        self.unsupported("storage_info")
    }
}

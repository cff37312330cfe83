use log::{info, warn};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::db::queries::{backup as backup_queries, repository as repo_queries};
use crate::image::ImageDriver;
use crate::models::backup::BackupDisk;
use crate::models::repository::{repo_type, Repository};

use super::immutability;
use super::object::ObjectBackend;
use super::{
    BackupFileMeta, ImmutabilityGuard, LocalBackend, NfsBackend, RepositoryBackend,
    RepositoryError,
};

/// Instantiates, caches, and composes repository backends from their DB rows.
///
/// The composition order is always `ImmutabilityGuard(backend)` when the row
/// carries a policy, so callers never reach an unguarded backend.
pub struct RepositoryManager {
    pool: Pool<Sqlite>,
    driver: Arc<dyn ImageDriver>,
    backends: RwLock<HashMap<i64, Arc<dyn RepositoryBackend>>>,
}

impl RepositoryManager {
    pub fn new(pool: Pool<Sqlite>, driver: Arc<dyn ImageDriver>) -> Self {
        Self {
            pool,
            driver,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// The backend for a repository id, built on first use.
    pub async fn backend(
        &self,
        repository_id: i64,
    ) -> Result<Arc<dyn RepositoryBackend>, RepositoryError> {
        {
            let cached = self.backends.read().await;
            if let Some(backend) = cached.get(&repository_id) {
                return Ok(backend.clone());
            }
        }

        let row = repo_queries::get_repository_by_id(&self.pool, repository_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(repository_id.to_string()))?;

        if !row.enabled {
            return Err(RepositoryError::Disabled(repository_id));
        }

        let backend = self.build_backend(&row)?;

        let mut cached = self.backends.write().await;
        cached.insert(repository_id, backend.clone());
        Ok(backend)
    }

    fn build_backend(&self, row: &Repository) -> Result<Arc<dyn RepositoryBackend>, RepositoryError> {
        let config = row
            .parse_config()
            .map_err(|e| RepositoryError::Config(e.to_string()))?;

        let base: Arc<dyn RepositoryBackend> = match row.repo_type.as_str() {
            repo_type::LOCAL => Arc::new(LocalBackend::new(
                row.id,
                PathBuf::from(&config.root),
                self.driver.clone(),
            )),
            repo_type::NFS => {
                let export = config.nfs_export.clone().ok_or_else(|| {
                    RepositoryError::Config("nfs repository missing nfs_export".into())
                })?;
                Arc::new(NfsBackend::new(
                    row.id,
                    PathBuf::from(&config.root),
                    export,
                    config.nfs_options.clone(),
                    self.driver.clone(),
                ))
            }
            repo_type::OBJECT => Arc::new(ObjectBackend::new(row.id)),
            other => {
                return Err(RepositoryError::Config(format!(
                    "unknown repository type: {}",
                    other
                )))
            }
        };

        Ok(match row.immutability_policy() {
            Some(policy) => Arc::new(ImmutabilityGuard::new(base, policy)),
            None => base,
        })
    }

    /// Refresh the capacity snapshot on the repository row. Called after
    /// every write operation against the backend.
    pub async fn refresh_capacity(&self, repository_id: i64) -> Result<(), RepositoryError> {
        let backend = self.backend(repository_id).await?;
        match backend.storage_info().await {
            Ok(info) => {
                repo_queries::update_capacity(
                    &self.pool,
                    repository_id,
                    info.total_bytes,
                    info.used_bytes,
                    info.available_bytes,
                )
                .await?;
                Ok(())
            }
            Err(RepositoryError::Unsupported(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletion is blocked while any backup still references the repository.
    pub async fn delete_repository(&self, repository_id: i64) -> Result<(), RepositoryError> {
        let references =
            repo_queries::count_backups_for_repository(&self.pool, repository_id).await?;
        if references > 0 {
            return Err(RepositoryError::DependencyPresent(references));
        }

        let removed = repo_queries::delete_repository(&self.pool, repository_id).await?;
        if removed == 0 {
            return Err(RepositoryError::NotFound(repository_id.to_string()));
        }

        self.backends.write().await.remove(&repository_id);
        info!("Deleted repository {}", repository_id);
        Ok(())
    }

    /// Drop a cached backend (configuration changed or repository disabled).
    pub async fn invalidate(&self, repository_id: i64) {
        self.backends.write().await.remove(&repository_id);
    }

    /// One pass of the immutability sweep across every policied repository.
    pub async fn retention_sweep(&self) {
        let repositories = match repo_queries::list_repositories(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Retention sweep: cannot list repositories: {}", e);
                return;
            }
        };

        for row in repositories {
            let policy = match row.immutability_policy() {
                Some(policy) => policy,
                None => continue,
            };
            if !row.enabled {
                continue;
            }

            let metas = match self.completed_backup_metas(row.id).await {
                Ok(metas) => metas,
                Err(e) => {
                    warn!("Retention sweep: listing backups for {}: {}", row.id, e);
                    continue;
                }
            };

            immutability::sweep_flags(&policy, &metas).await;
        }
    }

    /// Completed backup disks of a repository as delete/sweep metadata.
    pub async fn completed_backup_metas(
        &self,
        repository_id: i64,
    ) -> Result<Vec<BackupFileMeta>, RepositoryError> {
        let disks: Vec<BackupDisk> = sqlx::query_as(
            "SELECT d.* FROM backup_disks d
             JOIN backup_jobs j ON j.id = d.job_id
             JOIN backup_contexts c ON c.id = j.context_id
             WHERE c.repository_id = ? AND d.status = 'completed'",
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        let mut metas = Vec::with_capacity(disks.len());
        for disk in disks {
            let job = backup_queries::get_job_by_id(&self.pool, disk.job_id)
                .await?
                .ok_or_else(|| RepositoryError::NotFound(format!("job {}", disk.job_id)))?;
            metas.push(BackupFileMeta {
                image_path: PathBuf::from(&disk.image_path),
                backup_type: job.backup_type,
                created_at: job.created_at,
            });
        }
        Ok(metas)
    }
}

use log::{info, warn};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::db::queries::chain as chain_queries;
use crate::image::{ImageDriver, ImageError};
use crate::models::backup::{disk_status, BackupDisk};
use crate::models::chain::BackupChain;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain not found: {0}")]
    NotFound(String),

    #[error("Chain already exists for (context {context_id}, disk {disk_index})")]
    AlreadyExists { context_id: i64, disk_index: i64 },

    #[error("Chain {chain_id} is broken at backup {member_id}: {detail}")]
    Broken {
        chain_id: i64,
        member_id: i64,
        detail: String,
    },

    #[error("Chain still has {0} members; delete leaf-first")]
    DependencyPresent(i64),

    #[error("Concurrent append lost the head race on chain {0}")]
    Conflict(i64),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// High-level chain operations on top of the row-level chain repository.
///
/// Every (context, disk index) is an independent append-only log with a head
/// pointer; all mutation goes through the chain row so readers of `latest`
/// see a consistent snapshot.
pub struct ChainManager {
    pool: Pool<Sqlite>,
    driver: Arc<dyn ImageDriver>,
}

impl ChainManager {
    pub fn new(pool: Pool<Sqlite>, driver: Arc<dyn ImageDriver>) -> Self {
        Self { pool, driver }
    }

    /// Seed a new chain: the full backup is both root and head, count 1.
    pub async fn create_chain(
        &self,
        context_id: i64,
        disk_index: i64,
        full_backup_id: i64,
        size_bytes: i64,
    ) -> Result<BackupChain, ChainError> {
        let mut conn = self.pool.acquire().await?;
        let chain_id = self
            .create_chain_conn(&mut conn, context_id, disk_index, full_backup_id, size_bytes)
            .await?;
        chain_queries::get_chain_by_id_conn(&mut conn, chain_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))
    }

    /// Seed a new chain inside a caller-owned connection or transaction.
    /// The workflow engine uses this so "mark job completed + append to
    /// chains" stays one transaction.
    pub async fn create_chain_conn(
        &self,
        conn: &mut SqliteConnection,
        context_id: i64,
        disk_index: i64,
        full_backup_id: i64,
        size_bytes: i64,
    ) -> Result<i64, ChainError> {
        if chain_queries::get_chain_conn(&mut *conn, context_id, disk_index)
            .await?
            .is_some()
        {
            return Err(ChainError::AlreadyExists {
                context_id,
                disk_index,
            });
        }

        let chain_id = chain_queries::seed_chain_conn(
            &mut *conn,
            context_id,
            disk_index,
            full_backup_id,
            size_bytes,
        )
        .await?;
        chain_queries::attach_disk_conn(&mut *conn, chain_id, full_backup_id).await?;
        info!(
            "Created chain {} for (context {}, disk {})",
            chain_id, context_id, disk_index
        );
        Ok(chain_id)
    }

    /// Atomically append a backup to the chain head.
    ///
    /// The conditional head update serializes concurrent appenders; the
    /// loser re-reads `latest` once and retries, and a second loss is
    /// surfaced as a conflict.
    pub async fn append_to_chain(
        &self,
        chain_id: i64,
        backup_id: i64,
        size_bytes: i64,
    ) -> Result<BackupChain, ChainError> {
        let mut conn = self.pool.acquire().await?;
        self.append_to_chain_conn(&mut conn, chain_id, backup_id, size_bytes)
            .await?;
        chain_queries::get_chain_by_id_conn(&mut conn, chain_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))
    }

    /// Append inside a caller-owned connection or transaction, with the
    /// same compare-and-set retry on the head pointer.
    pub async fn append_to_chain_conn(
        &self,
        conn: &mut SqliteConnection,
        chain_id: i64,
        backup_id: i64,
        size_bytes: i64,
    ) -> Result<(), ChainError> {
        let mut chain = chain_queries::get_chain_by_id_conn(&mut *conn, chain_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))?;

        for _ in 0..2 {
            let advanced = chain_queries::advance_chain_head_conn(
                &mut *conn,
                chain_id,
                chain.latest_backup_id,
                backup_id,
                size_bytes,
            )
            .await?;

            if advanced > 0 {
                chain_queries::attach_disk_conn(&mut *conn, chain_id, backup_id).await?;
                return Ok(());
            }

            // Lost the head race: re-read `latest` and retry once
            chain = chain_queries::get_chain_by_id_conn(&mut *conn, chain_id)
                .await?
                .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))?;
        }

        Err(ChainError::Conflict(chain_id))
    }

    pub async fn get_chain(
        &self,
        context_id: i64,
        disk_index: i64,
    ) -> Result<Option<BackupChain>, ChainError> {
        Ok(chain_queries::get_chain(&self.pool, context_id, disk_index).await?)
    }

    pub async fn get_chain_by_id(&self, chain_id: i64) -> Result<Option<BackupChain>, ChainError> {
        Ok(chain_queries::get_chain_by_id(&self.pool, chain_id).await?)
    }

    pub async fn list_members(&self, chain_id: i64) -> Result<Vec<BackupDisk>, ChainError> {
        Ok(chain_queries::list_backups_for_chain(&self.pool, chain_id).await?)
    }

    /// Assert the chain is restorable end to end: one full at the root,
    /// every later member's parent pointer naming the preceding member, and
    /// every image passing driver validation.
    pub async fn validate_chain(&self, chain_id: i64) -> Result<(), ChainError> {
        let chain = self
            .get_chain_by_id(chain_id)
            .await?
            .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))?;
        let members = self.list_members(chain_id).await?;

        let first = members.first().ok_or_else(|| ChainError::Broken {
            chain_id,
            member_id: chain.full_backup_id,
            detail: "chain has no members".into(),
        })?;

        if first.id != chain.full_backup_id {
            return Err(ChainError::Broken {
                chain_id,
                member_id: first.id,
                detail: "first member is not the chain root".into(),
            });
        }
        if first.parent_image_path.is_some() {
            return Err(ChainError::Broken {
                chain_id,
                member_id: first.id,
                detail: "chain root has a parent image".into(),
            });
        }

        for window in members.windows(2) {
            let (previous, member) = (&window[0], &window[1]);
            if member.status != disk_status::COMPLETED {
                return Err(ChainError::Broken {
                    chain_id,
                    member_id: member.id,
                    detail: format!("member status is {}", member.status),
                });
            }
            match &member.parent_image_path {
                Some(parent) if parent == &previous.image_path => {}
                Some(parent) => {
                    return Err(ChainError::Broken {
                        chain_id,
                        member_id: member.id,
                        detail: format!(
                            "parent {} does not match preceding member {}",
                            parent, previous.image_path
                        ),
                    })
                }
                None => {
                    return Err(ChainError::Broken {
                        chain_id,
                        member_id: member.id,
                        detail: "non-root member has no parent image".into(),
                    })
                }
            }
        }

        if let Some(last) = members.last() {
            if last.id != chain.latest_backup_id {
                warn!(
                    "Chain {} head {} is not the newest member {}",
                    chain_id, chain.latest_backup_id, last.id
                );
            }
        }

        for member in &members {
            self.driver
                .validate(Path::new(&member.image_path))
                .await
                .map_err(|e| ChainError::Broken {
                    chain_id,
                    member_id: member.id,
                    detail: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// A member can only be removed while nothing depends on it.
    pub async fn assert_leaf(&self, backup_disk_id: i64) -> Result<(), ChainError> {
        let dependents =
            chain_queries::count_backup_dependencies(&self.pool, backup_disk_id).await?;
        if dependents > 0 {
            return Err(ChainError::DependencyPresent(dependents));
        }
        Ok(())
    }

    /// Record the removal of the chain's current leaf: the head retreats to
    /// the previous member, or the chain row disappears with its last one.
    pub async fn remove_leaf(&self, chain_id: i64, backup_disk_id: i64, size_bytes: i64) -> Result<(), ChainError> {
        let members = self.list_members(chain_id).await?;
        let remaining: Vec<_> = members.iter().filter(|m| m.id != backup_disk_id).collect();

        chain_queries::detach_disk_from_chain(&self.pool, backup_disk_id).await?;

        match remaining.last() {
            Some(new_leaf) => {
                chain_queries::retreat_chain_head(&self.pool, chain_id, new_leaf.id, size_bytes)
                    .await?;
            }
            None => {
                chain_queries::delete_chain(&self.pool, chain_id).await?;
                info!("Deleted chain {} with its last member", chain_id);
            }
        }
        Ok(())
    }

    /// Refuses while any member exists; callers must delete leaf-first.
    pub async fn delete_chain(&self, chain_id: i64) -> Result<(), ChainError> {
        let members = chain_queries::count_chain_members(&self.pool, chain_id).await?;
        if members > 0 {
            return Err(ChainError::DependencyPresent(members));
        }
        let removed = chain_queries::delete_chain(&self.pool, chain_id).await?;
        if removed == 0 {
            return Err(ChainError::NotFound(chain_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::backup as backup_queries;
    use crate::db_manager::manager::test_pool;
    use crate::image::ImageInfo;
    use async_trait::async_trait;

    /// Driver stub that treats every image as a valid qcow2.
    struct AcceptAllDriver;

    #[async_trait]
    impl ImageDriver for AcceptAllDriver {
        async fn create_full(&self, _path: &Path, _size: i64) -> Result<(), ImageError> {
            Ok(())
        }
        async fn create_incremental(&self, _path: &Path, _parent: &Path) -> Result<(), ImageError> {
            Ok(())
        }
        async fn validate(&self, _path: &Path) -> Result<(), ImageError> {
            Ok(())
        }
        async fn info(&self, path: &Path) -> Result<ImageInfo, ImageError> {
            Ok(ImageInfo {
                path: path.display().to_string(),
                format: "qcow2".into(),
                logical_size: 0,
                physical_size: 0,
                backing_file: None,
            })
        }
        async fn delete_if_leaf(&self, _path: &Path) -> Result<(), ImageError> {
            Ok(())
        }
    }

    async fn fixture() -> (Pool<Sqlite>, ChainManager, i64) {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO repositories (name, repo_type, config, created_at)
             VALUES ('r1', 'local', '{\"root\":\"/tmp/repo\"}', ?)",
        )
        .bind(chrono::Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        let ctx = backup_queries::get_or_create_context(&pool, "pgtest1", 1)
            .await
            .unwrap();
        let manager = ChainManager::new(pool.clone(), Arc::new(AcceptAllDriver));
        (pool, manager, ctx.id)
    }

    async fn completed_disk(
        pool: &Pool<Sqlite>,
        context_id: i64,
        disk_index: i64,
        parent: Option<&str>,
    ) -> BackupDisk {
        let job = backup_queries::create_job(pool, context_id, "pgtest1", "full")
            .await
            .unwrap();
        let image = format!("/tmp/repo/ctx-{}/disk-{}/{}.qcow2", context_id, disk_index, job.id);
        let disk = backup_queries::create_disk(
            pool,
            backup_queries::NewBackupDisk {
                job_id: job.id,
                disk_index,
                source_disk_key: "2000",
                image_path: &image,
                parent_image_path: parent,
                size_bytes: 1024,
            },
        )
        .await
        .unwrap();
        backup_queries::mark_job_running(pool, job.id).await.unwrap();
        backup_queries::complete_disk(pool, job.id, disk_index, "cm-x", 512)
            .await
            .unwrap();
        backup_queries::get_disk_by_id(pool, disk.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn chain_create_append_validate() {
        let (pool, manager, ctx) = fixture().await;

        let full = completed_disk(&pool, ctx, 0, None).await;
        let chain = manager.create_chain(ctx, 0, full.id, 1024).await.unwrap();
        assert_eq!(chain.full_backup_id, full.id);
        assert_eq!(chain.latest_backup_id, full.id);
        assert_eq!(chain.total_backups, 1);

        let incr = completed_disk(&pool, ctx, 0, Some(full.image_path.as_str())).await;
        let chain = manager.append_to_chain(chain.id, incr.id, 256).await.unwrap();
        assert_eq!(chain.latest_backup_id, incr.id);
        assert_eq!(chain.total_backups, 2);
        assert_eq!(chain.total_size_bytes, 1024 + 256);

        manager.validate_chain(chain.id).await.unwrap();

        let members = manager.list_members(chain.id).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members[0].parent_image_path.is_none());
        assert_eq!(
            members[1].parent_image_path.as_deref(),
            Some(full.image_path.as_str())
        );
    }

    #[tokio::test]
    async fn duplicate_chain_is_refused() {
        let (pool, manager, ctx) = fixture().await;
        let full = completed_disk(&pool, ctx, 0, None).await;
        manager.create_chain(ctx, 0, full.id, 1024).await.unwrap();
        let err = manager.create_chain(ctx, 0, full.id, 1024).await.unwrap_err();
        assert!(matches!(err, ChainError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn broken_parent_pointer_fails_validation() {
        let (pool, manager, ctx) = fixture().await;
        let full = completed_disk(&pool, ctx, 0, None).await;
        let chain = manager.create_chain(ctx, 0, full.id, 1024).await.unwrap();

        // Parent names an image that is not the preceding member
        let stray = completed_disk(&pool, ctx, 0, Some("/tmp/repo/elsewhere.qcow2")).await;
        manager.append_to_chain(chain.id, stray.id, 64).await.unwrap();

        let err = manager.validate_chain(chain.id).await.unwrap_err();
        match err {
            ChainError::Broken { member_id, .. } => assert_eq!(member_id, stray.id),
            other => panic!("expected Broken, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delete_refused_until_leaf_first() {
        let (pool, manager, ctx) = fixture().await;
        let full = completed_disk(&pool, ctx, 0, None).await;
        let chain = manager.create_chain(ctx, 0, full.id, 1024).await.unwrap();
        let incr = completed_disk(&pool, ctx, 0, Some(full.image_path.as_str())).await;
        manager.append_to_chain(chain.id, incr.id, 64).await.unwrap();

        // The root has a dependent; the chain has members
        assert!(matches!(
            manager.assert_leaf(full.id).await.unwrap_err(),
            ChainError::DependencyPresent(1)
        ));
        assert!(matches!(
            manager.delete_chain(chain.id).await.unwrap_err(),
            ChainError::DependencyPresent(2)
        ));

        // Leaf removal retreats the head to the root
        manager.assert_leaf(incr.id).await.unwrap();
        manager.remove_leaf(chain.id, incr.id, 64).await.unwrap();
        backup_queries::delete_disk(&pool, incr.id).await.unwrap();
        let chain = manager.get_chain_by_id(chain.id).await.unwrap().unwrap();
        assert_eq!(chain.latest_backup_id, full.id);
        assert_eq!(chain.total_backups, 1);

        // Removing the last member deletes the chain row
        manager.remove_leaf(chain.id, full.id, 1024).await.unwrap();
        backup_queries::delete_disk(&pool, full.id).await.unwrap();
        assert!(manager.get_chain_by_id(chain.id).await.unwrap().is_none());
    }
}

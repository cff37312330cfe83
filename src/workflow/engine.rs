use log::{error, info, warn};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::chain::ChainManager;
use crate::db::queries::backup as backup_queries;
use crate::db::queries::chain as chain_queries;
use crate::export::{Export, ExportBroker};
use crate::models::backup::{disk_status, job_status, BackupDisk, BackupJob, BackupType};
use crate::repository::{BackupFileMeta, BackupImageSpec, RepositoryManager};
use crate::models::tracker::tracked_status;
use crate::tracker::{JobContext, JobSpec, JobTracker};

use super::agent::{CaptureAgent, NbdTarget, ReplicationRequest};
use super::{BackupJobStarted, BackupRequest, DiskExport, WorkflowError};

/// Engine knobs resolved from the server configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Base URL the capture agent calls back into
    pub callback_base_url: String,
    /// Host part of the NBD URLs handed to the agent
    pub nbd_host: String,
    /// Wall-clock bound after which an unresponsive job is failed
    pub job_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8400".into(),
            nbd_host: "127.0.0.1".into(),
            job_timeout: Duration::from_secs(240 * 60),
        }
    }
}

/// Close out the execution-side record of a backup job. The tracker row is
/// found through the context id the engine stamped at start time.
async fn end_tracker_job(
    tracker: &JobTracker,
    backup_job_id: i64,
    status: &str,
    error: Option<&str>,
) {
    let key = format!("backup-job-{}", backup_job_id);
    let tracked = match tracker.find_job_by_any_id(&key).await {
        Ok(tracked) => tracked,
        Err(_) => return,
    };
    if tracked_status::is_terminal(&tracked.status) {
        return;
    }
    let ctx = JobContext {
        job_id: Some(tracked.id),
        step_id: None,
        external_id: tracked.external_id.clone(),
    };
    if status == tracked_status::COMPLETED {
        let _ = tracker.mark_job_progress(tracked.id, 100).await;
    }
    let _ = tracker.end_job(&ctx, tracked.id, status, error).await;
}

/// Parent image resolved for one disk before any resource is allocated.
struct ResolvedParent {
    chain_id: i64,
    parent_image_path: String,
}

/// Everything allocated for one disk during the prepare phase, kept so the
/// rollback path can unwind in reverse.
struct PreparedDisk {
    row: BackupDisk,
    export: Export,
}

/// Orchestrates a backup job end to end: parent resolution, image and
/// export preparation, capture-agent trigger, per-disk completion, and the
/// single-transaction finalization that appends to chains.
pub struct BackupWorkflowEngine {
    pool: Pool<Sqlite>,
    repositories: Arc<RepositoryManager>,
    chains: Arc<ChainManager>,
    broker: Arc<ExportBroker>,
    agent: Arc<dyn CaptureAgent>,
    tracker: Arc<JobTracker>,
    settings: EngineSettings,
}

impl BackupWorkflowEngine {
    pub fn new(
        pool: Pool<Sqlite>,
        repositories: Arc<RepositoryManager>,
        chains: Arc<ChainManager>,
        broker: Arc<ExportBroker>,
        agent: Arc<dyn CaptureAgent>,
        tracker: Arc<JobTracker>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            pool,
            repositories,
            chains,
            broker,
            agent,
            tracker,
            settings,
        }
    }

    /// One-shot backup: validate, prepare every disk, trigger the capture
    /// agent once, and transition the job to running.
    pub async fn start_backup(
        &self,
        request: BackupRequest,
    ) -> Result<BackupJobStarted, WorkflowError> {
        self.validate_request(&request)?;

        // Parent resolution happens before any row or resource exists so a
        // doomed request leaves nothing behind.
        let existing_context = sqlx::query_as::<_, crate::models::backup::BackupContext>(
            "SELECT * FROM backup_contexts WHERE vm_name = ? AND repository_id = ?",
        )
        .bind(&request.vm_name)
        .bind(request.repository_id)
        .fetch_optional(&self.pool)
        .await?;

        let parents = self
            .resolve_parents(&request, existing_context.as_ref().map(|c| c.id))
            .await?;

        // The backend is resolved early so a missing/disabled repository
        // fails before the job row is created.
        let backend = self.repositories.backend(request.repository_id).await?;

        let context = match existing_context {
            Some(ctx) => ctx,
            None => {
                backup_queries::get_or_create_context(
                    &self.pool,
                    &request.vm_name,
                    request.repository_id,
                )
                .await?
            }
        };

        let job = backup_queries::create_job(
            &self.pool,
            context.id,
            &request.vm_name,
            request.backup_type.as_str(),
        )
        .await?;

        let (tracker_ctx, tracker_id) = self
            .tracker
            .start_job(
                &JobContext::default(),
                JobSpec {
                    job_type: "backup".into(),
                    operation: format!("{}-backup", request.backup_type),
                    owner: Some("system".into()),
                    context_id: Some(format!("backup-job-{}", job.id)),
                    category: Some("workflow".into()),
                    ..Default::default()
                },
            )
            .await?;

        // Phase 1: prepare all disks locally, without touching the agent.
        let mut prepared: Vec<PreparedDisk> = Vec::with_capacity(request.disks.len());
        for disk in &request.disks {
            let parent = parents.get(&disk.disk_index);
            match self
                .prepare_backup_disk(&request, context.id, job.id, disk, parent, backend.as_ref())
                .await
            {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    error!(
                        "Prepare failed for job {} disk {}: {}; rolling back {} prepared disks",
                        job.id,
                        disk.disk_index,
                        e,
                        prepared.len()
                    );
                    self.rollback_prepared(job.id, &prepared).await;
                    backup_queries::mark_job_failed(
                        &self.pool,
                        job.id,
                        job_status::FAILED,
                        &e.to_string(),
                    )
                    .await?;
                    self.tracker
                        .end_job(&tracker_ctx, tracker_id, "failed", Some(&e.to_string()))
                        .await?;
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.repositories.refresh_capacity(request.repository_id).await {
            warn!("Capacity refresh after prepare failed: {}", e);
        }

        // Phase 2: a single RPC carrying every export.
        let replication = self.build_replication_request(&request, job.id, &prepared);
        if let Err(e) = self.agent.replicate(&replication).await {
            error!("Capture agent trigger failed for job {}: {}", job.id, e);
            self.rollback_prepared(job.id, &prepared).await;
            backup_queries::mark_job_failed(&self.pool, job.id, job_status::FAILED, &e.to_string())
                .await?;
            self.tracker
                .end_job(&tracker_ctx, tracker_id, "failed", Some(&e.to_string()))
                .await?;
            return Err(e);
        }

        backup_queries::mark_job_running(&self.pool, job.id).await?;
        self.tracker.mark_job_progress(tracker_id, 5).await?;
        self.tracker
            .log(
                &tracker_ctx,
                "info",
                &format!("capture agent triggered for {} disks", prepared.len()),
            )
            .await;
        self.spawn_watchdog(job.id);

        info!(
            "Backup job {} running: {} {} disks of {}",
            job.id,
            request.backup_type,
            prepared.len(),
            request.vm_name
        );

        Ok(BackupJobStarted {
            job_id: job.id,
            context_id: context.id,
            backup_type: request.backup_type,
            disks: prepared
                .iter()
                .map(|p| DiskExport {
                    disk_index: p.row.disk_index,
                    image_path: p.row.image_path.clone(),
                    port: p.export.port,
                    export_name: p.export.export_name.clone(),
                    nbd_url: p.export.device_url(&self.settings.nbd_host),
                })
                .collect(),
        })
    }

    fn validate_request(&self, request: &BackupRequest) -> Result<(), WorkflowError> {
        if request.vm_name.trim().is_empty() {
            return Err(WorkflowError::Validation("vm_name is required".into()));
        }
        if request.disks.is_empty() {
            return Err(WorkflowError::Validation(
                "at least one disk is required".into(),
            ));
        }
        if request.backup_type == BackupType::Incremental {
            for disk in &request.disks {
                if disk
                    .previous_change_id
                    .as_deref()
                    .map_or(true, |c| c.is_empty())
                {
                    return Err(WorkflowError::Validation(format!(
                        "incremental backup requires a previous change id for disk {}",
                        disk.disk_index
                    )));
                }
            }
        }
        let mut seen = std::collections::HashSet::new();
        for disk in &request.disks {
            if !seen.insert(disk.disk_index) {
                return Err(WorkflowError::Validation(format!(
                    "duplicate disk index {}",
                    disk.disk_index
                )));
            }
        }
        Ok(())
    }

    /// Step 2 of the algorithm: per-disk parent resolution under the chain
    /// head snapshot.
    async fn resolve_parents(
        &self,
        request: &BackupRequest,
        context_id: Option<i64>,
    ) -> Result<HashMap<i64, ResolvedParent>, WorkflowError> {
        let mut parents = HashMap::new();

        for disk in &request.disks {
            let chain = match context_id {
                Some(ctx) => self.chains.get_chain(ctx, disk.disk_index).await?,
                None => None,
            };

            match request.backup_type {
                BackupType::Full => {
                    // Re-basing an existing chain with a fresh full is not
                    // supported today.
                    if chain.is_some() {
                        return Err(WorkflowError::Conflict(format!(
                            "chain already exists for disk {}; delete it before a new full",
                            disk.disk_index
                        )));
                    }
                }
                BackupType::Incremental => {
                    let chain = chain.ok_or_else(|| {
                        WorkflowError::ParentMissing(format!(
                            "no backup chain for {} disk {}",
                            request.vm_name, disk.disk_index
                        ))
                    })?;

                    let head = backup_queries::get_disk_by_id(&self.pool, chain.latest_backup_id)
                        .await?
                        .ok_or_else(|| {
                            WorkflowError::ParentMissing(format!(
                                "chain {} head {} has no row",
                                chain.id, chain.latest_backup_id
                            ))
                        })?;

                    if head.status != disk_status::COMPLETED {
                        return Err(WorkflowError::ParentMissing(format!(
                            "chain head for disk {} is {} rather than completed",
                            disk.disk_index, head.status
                        )));
                    }

                    // A stale marker means the caller resolved its parent
                    // before a concurrent incremental moved the head.
                    if let (Some(requested), Some(actual)) =
                        (disk.previous_change_id.as_deref(), head.change_id.as_deref())
                    {
                        if requested != actual {
                            return Err(WorkflowError::Conflict(format!(
                                "overlapping incremental for disk {}: marker {} is stale (head is {})",
                                disk.disk_index, requested, actual
                            )));
                        }
                    }

                    parents.insert(
                        disk.disk_index,
                        ResolvedParent {
                            chain_id: chain.id,
                            parent_image_path: head.image_path.clone(),
                            
                        },
                    );
                }
            }
        }

        Ok(parents)
    }

    /// Step 4 for one disk: image, port, image server, disk row, in that
    /// order, so the rollback path can unwind in reverse.
    async fn prepare_backup_disk(
        &self,
        request: &BackupRequest,
        context_id: i64,
        job_id: i64,
        disk: &super::DiskRequest,
        parent: Option<&ResolvedParent>,
        backend: &dyn crate::repository::RepositoryBackend,
    ) -> Result<PreparedDisk, WorkflowError> {
        let image_path = backend
            .create_backup(&BackupImageSpec {
                context_id,
                disk_index: disk.disk_index,
                backup_id: job_id,
                backup_type: request.backup_type.as_str().to_string(),
                size_bytes: disk.size_bytes,
                parent_image_path: parent.map(|p| PathBuf::from(&p.parent_image_path)),
            })
            .await?;

        let row = match backup_queries::create_disk(
            &self.pool,
            backup_queries::NewBackupDisk {
                job_id,
                disk_index: disk.disk_index,
                source_disk_key: &disk.source_disk_key,
                image_path: &image_path.display().to_string(),
                parent_image_path: parent.map(|p| p.parent_image_path.as_str()),
                size_bytes: disk.size_bytes,
            },
        )
        .await
        {
            Ok(row) => row,
            Err(e) => {
                self.remove_image_file(&image_path.display().to_string()).await;
                return Err(e.into());
            }
        };

        let export = match self.broker.create_export(&request.vm_name, &row).await {
            Ok(export) => export,
            Err(e) => {
                backup_queries::delete_disk(&self.pool, row.id).await.ok();
                self.remove_image_file(&row.image_path).await;
                return Err(e.into());
            }
        };

        Ok(PreparedDisk { row, export })
    }

    /// Unwind every prepared disk: stop the server, release the port, delete
    /// the image, delete the row.
    async fn rollback_prepared(&self, job_id: i64, prepared: &[PreparedDisk]) {
        for p in prepared {
            if let Err(e) = self.broker.destroy_export(p.export.port).await {
                warn!(
                    "Rollback: destroying export on port {} failed: {}",
                    p.export.port, e
                );
            }
            self.remove_image_file(&p.row.image_path).await;
            if let Err(e) = backup_queries::delete_disk(&self.pool, p.row.id).await {
                warn!("Rollback: deleting disk row {} failed: {}", p.row.id, e);
            }
        }
        // Catch anything the loop above missed (exports without a row)
        self.broker.destroy_exports_for_job(job_id).await;
    }

    /// Rollbacks bypass the repository guard on purpose: a just-created,
    /// never-completed image is not a retained backup.
    async fn remove_image_file(&self, image_path: &str) {
        match tokio::fs::remove_file(image_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove image {}: {}", image_path, e),
        }
    }

    fn build_replication_request(
        &self,
        request: &BackupRequest,
        job_id: i64,
        prepared: &[PreparedDisk],
    ) -> ReplicationRequest {
        ReplicationRequest {
            job_id: job_id.to_string(),
            vcenter: request.hypervisor.vcenter.clone(),
            username: request.hypervisor.username.clone(),
            password: request.hypervisor.password.clone(),
            vm_paths: vec![request.hypervisor.vm_path.clone()],
            oma_url: self.settings.callback_base_url.clone(),
            nbd_targets: prepared
                .iter()
                .map(|p| {
                    let requested = request
                        .disks
                        .iter()
                        .find(|d| d.disk_index == p.row.disk_index);
                    NbdTarget {
                        device_path: p.export.device_url(&self.settings.nbd_host),
                        vmware_disk_key: p.row.source_disk_key.clone(),
                        previous_change_id: requested.and_then(|d| d.previous_change_id.clone()),
                    }
                })
                .collect(),
        }
    }

    /// Step 7: per-disk completion callback from the capture agent.
    pub async fn complete_disk(
        &self,
        job_id: i64,
        disk_index: i64,
        change_id: &str,
        bytes_transferred: i64,
    ) -> Result<(), WorkflowError> {
        let job = backup_queries::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("backup job {}", job_id)))?;
        backup_queries::get_disk(&self.pool, job_id, disk_index)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("job {} has no disk {}", job_id, disk_index))
            })?;

        if job_status::is_terminal(&job.status) {
            return Err(WorkflowError::Conflict(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let updated = backup_queries::complete_disk(
            &self.pool,
            job_id,
            disk_index,
            change_id,
            bytes_transferred,
        )
        .await?;
        if updated == 0 {
            // Duplicate callback for an already-completed disk
            info!(
                "Ignoring duplicate completion for job {} disk {}",
                job_id, disk_index
            );
            return Ok(());
        }

        info!(
            "Disk {} of job {} completed ({} bytes, change id {})",
            disk_index, job_id, bytes_transferred, change_id
        );

        let (completed, total) = backup_queries::disk_counts(&self.pool, job_id).await?;
        if completed == total {
            self.finalize_job(&job).await?;
        }
        Ok(())
    }

    /// The last callback finalizes in one transaction: job completed,
    /// context statistics, every disk appended to its chain. Teardown of
    /// exports and ports happens after commit.
    async fn finalize_job(&self, job: &BackupJob) -> Result<(), WorkflowError> {
        let disks = backup_queries::list_disks_for_job(&self.pool, job.id).await?;

        let aggregated = backup_queries::sum_disk_bytes(&self.pool, job.id).await?;
        let telemetry = job.bytes_transferred;
        let total_bytes = if telemetry > 0 { telemetry } else { aggregated };
        if telemetry > 0 && aggregated > 0 && telemetry != aggregated {
            let drift = (telemetry - aggregated).unsigned_abs();
            if drift * 100 > aggregated.unsigned_abs() {
                warn!(
                    "Job {}: telemetry bytes {} disagree with disk aggregation {}",
                    job.id, telemetry, aggregated
                );
            }
        }

        let mut tx = self.pool.begin().await?;

        if !backup_queries::mark_job_completed_conn(&mut *tx, job.id, total_bytes).await? {
            // Another callback finalized first
            tx.rollback().await?;
            return Ok(());
        }

        backup_queries::update_context_stats_conn(&mut *tx, job.id, &job.backup_type).await?;

        // Appends go through the chain manager so the head compare-and-set
        // (and its retry on a lost race) guards jobs finalizing against the
        // same chain concurrently.
        for disk in &disks {
            let existing = chain_queries::get_chain_conn(&mut *tx, job.context_id, disk.disk_index)
                .await?;
            match existing {
                Some(chain) => {
                    self.chains
                        .append_to_chain_conn(&mut *tx, chain.id, disk.id, disk.bytes_transferred)
                        .await?;
                }
                None => {
                    self.chains
                        .create_chain_conn(
                            &mut *tx,
                            job.context_id,
                            disk.disk_index,
                            disk.id,
                            disk.bytes_transferred,
                        )
                        .await?;
                }
            }
        }

        tx.commit().await?;

        self.broker.destroy_exports_for_job(job.id).await;
        end_tracker_job(&self.tracker, job.id, tracked_status::COMPLETED, None).await;

        if let Err(e) = self
            .repositories
            .refresh_capacity(self.repository_id_of(job).await?)
            .await
        {
            warn!("Capacity refresh after completion failed: {}", e);
        }

        info!(
            "Backup job {} completed: {} disks, {} bytes",
            job.id,
            disks.len(),
            total_bytes
        );
        Ok(())
    }

    async fn repository_id_of(&self, job: &BackupJob) -> Result<i64, WorkflowError> {
        let context = backup_queries::get_context_by_id(&self.pool, job.context_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("context {}", job.context_id)))?;
        Ok(context.repository_id)
    }

    /// Step 8: per-disk failure callback. The failing disk takes the whole
    /// job with it; images stay on disk for post-mortem.
    pub async fn fail_disk(
        &self,
        job_id: i64,
        disk_index: i64,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        backup_queries::get_disk(&self.pool, job_id, disk_index)
            .await?
            .ok_or_else(|| {
                WorkflowError::NotFound(format!("job {} has no disk {}", job_id, disk_index))
            })?;

        backup_queries::fail_disk(&self.pool, job_id, disk_index).await?;
        backup_queries::mark_job_failed(
            &self.pool,
            job_id,
            job_status::FAILED,
            &format!("disk {} failed: {}", disk_index, reason),
        )
        .await?;

        self.broker.destroy_exports_for_job(job_id).await;
        end_tracker_job(&self.tracker, job_id, tracked_status::FAILED, Some(reason)).await;

        error!("Backup job {} failed on disk {}: {}", job_id, disk_index, reason);
        Ok(())
    }

    /// Operator cancel: best-effort agent stop, teardown, and rollback of
    /// images since the job as a whole never completed.
    pub async fn cancel_job(&self, job_id: i64) -> Result<(), WorkflowError> {
        let job = backup_queries::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("backup job {}", job_id)))?;

        if job_status::is_terminal(&job.status) {
            return Err(WorkflowError::Conflict(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        self.agent.cancel(&job_id.to_string()).await;

        backup_queries::mark_job_failed(
            &self.pool,
            job_id,
            job_status::CANCELLED,
            "cancelled by operator",
        )
        .await?;

        self.broker.destroy_exports_for_job(job_id).await;

        for disk in backup_queries::list_disks_for_job(&self.pool, job_id).await? {
            self.remove_image_file(&disk.image_path).await;
        }

        end_tracker_job(&self.tracker, job_id, tracked_status::CANCELLED, None).await;

        info!("Backup job {} cancelled", job_id);
        Ok(())
    }

    /// Step 9: supervisory timer that fails a job stuck past its wall-clock
    /// bound with the same teardown path as a disk failure.
    fn spawn_watchdog(&self, job_id: i64) {
        let pool = self.pool.clone();
        let broker = self.broker.clone();
        let tracker = self.tracker.clone();
        let timeout = self.settings.job_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let job = match backup_queries::get_job_by_id(&pool, job_id).await {
                Ok(Some(job)) => job,
                _ => return,
            };
            if job_status::is_terminal(&job.status) {
                return;
            }
            warn!(
                "Backup job {} exceeded its {}s deadline; failing it",
                job_id,
                timeout.as_secs()
            );
            if let Err(e) = backup_queries::mark_job_failed(
                &pool,
                job_id,
                job_status::FAILED,
                "timed out waiting for capture agent",
            )
            .await
            {
                error!("Watchdog could not fail job {}: {}", job_id, e);
            }
            broker.destroy_exports_for_job(job_id).await;
            end_tracker_job(
                &tracker,
                job_id,
                tracked_status::FAILED,
                Some("timed out waiting for capture agent"),
            )
            .await;
        });
    }

    /// Job plus per-disk rows and aggregate progress for GET handlers.
    pub async fn job_overview(
        &self,
        job_id: i64,
    ) -> Result<(BackupJob, Vec<BackupDisk>, (i64, i64)), WorkflowError> {
        let job = backup_queries::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("backup job {}", job_id)))?;
        let disks = backup_queries::list_disks_for_job(&self.pool, job_id).await?;
        let counts = backup_queries::disk_counts(&self.pool, job_id).await?;
        Ok((job, disks, counts))
    }

    /// Delete a terminal backup job and its disks, leaf-first, through the
    /// repository guard (retention applies). Restore mounts must already be
    /// gone: the OS-level teardown belongs to the mount manager.
    pub async fn delete_backup(&self, job_id: i64) -> Result<(), WorkflowError> {
        let job = backup_queries::get_job_by_id(&self.pool, job_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("backup job {}", job_id)))?;

        if !job_status::is_terminal(&job.status) {
            return Err(WorkflowError::Conflict(format!(
                "job {} is still {}",
                job_id, job.status
            )));
        }

        let repository_id = self.repository_id_of(&job).await?;
        let backend = self.repositories.backend(repository_id).await?;
        let disks = backup_queries::list_disks_for_job(&self.pool, job_id).await?;

        // Dependency and mount checks across every disk before any deletion
        for disk in &disks {
            self.chains.assert_leaf(disk.id).await?;

            let mounted = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM restore_mounts WHERE backup_disk_id = ?",
            )
            .bind(disk.id)
            .fetch_one(&self.pool)
            .await?;
            if mounted > 0 {
                return Err(WorkflowError::Conflict(format!(
                    "disk {} of job {} still has an active restore mount",
                    disk.disk_index, job_id
                )));
            }
        }

        for disk in &disks {
            if disk.status == disk_status::COMPLETED {
                backend
                    .delete_backup(&BackupFileMeta {
                        image_path: PathBuf::from(&disk.image_path),
                        backup_type: job.backup_type.clone(),
                        created_at: job.created_at,
                    })
                    .await?;
            } else {
                self.remove_image_file(&disk.image_path).await;
            }

            if let Some(chain_id) = disk.chain_id {
                self.chains
                    .remove_leaf(chain_id, disk.id, disk.bytes_transferred)
                    .await?;
            }
            backup_queries::delete_disk(&self.pool, disk.id).await?;
        }

        sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        if let Err(e) = self.repositories.refresh_capacity(repository_id).await {
            warn!("Capacity refresh after delete failed: {}", e);
        }

        info!("Deleted backup job {} ({} disks)", job_id, disks.len());
        Ok(())
    }

    /// Startup resumption: jobs caught mid-flight by a restart are failed,
    /// their unfinished images deleted, and the export plane reconciled
    /// against whatever processes survived.
    pub async fn recover_interrupted_jobs(&self) -> Result<(), WorkflowError> {
        let stuck = backup_queries::list_jobs_by_statuses(
            &self.pool,
            &[job_status::PENDING, job_status::RUNNING],
        )
        .await?;

        for job in &stuck {
            warn!(
                "Job {} was {} at shutdown; failing it as orphaned",
                job.id, job.status
            );
            for disk in backup_queries::list_disks_for_job(&self.pool, job.id).await? {
                // Completed images stay for diagnostics; they were never
                // appended to a chain so nothing references them.
                if disk.status != disk_status::COMPLETED {
                    self.remove_image_file(&disk.image_path).await;
                    backup_queries::fail_disk(&self.pool, job.id, disk.disk_index).await?;
                }
            }
            backup_queries::mark_job_failed(
                &self.pool,
                job.id,
                job_status::FAILED,
                "orphaned by restart",
            )
            .await?;
            self.broker.destroy_exports_for_job(job.id).await;
            end_tracker_job(
                &self.tracker,
                job.id,
                tracked_status::FAILED,
                Some("orphaned by restart"),
            )
            .await;
        }

        self.broker.reconcile_orphans().await?;
        self.broker.ports().reconcile_with_os();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::manager::test_pool;
    use crate::export::{
        ExportError, ImageServerSpec, ImageServerSupervisor, OrphanProcess, PortAllocator,
    };
    use crate::image::{ImageDriver, ImageError, ImageInfo};
    use crate::workflow::agent::ReplicationRequest;
    use crate::workflow::{DiskRequest, HypervisorTarget};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex as SyncMutex;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Creates empty files instead of qcow2 images and remembers backing
    /// links so chain semantics stay observable.
    struct FileDriver {
        backings: SyncMutex<HashMap<String, String>>,
    }

    impl FileDriver {
        fn new() -> Self {
            Self {
                backings: SyncMutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl ImageDriver for FileDriver {
        async fn create_full(&self, path: &Path, _size: i64) -> Result<(), ImageError> {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, b"").await?;
            Ok(())
        }

        async fn create_incremental(&self, path: &Path, parent: &Path) -> Result<(), ImageError> {
            if !parent.exists() {
                return Err(ImageError::MissingBackingFile {
                    path: path.display().to_string(),
                    backing: parent.display().to_string(),
                });
            }
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, b"").await?;
            self.backings.lock().insert(
                path.display().to_string(),
                parent.display().to_string(),
            );
            Ok(())
        }

        async fn validate(&self, path: &Path) -> Result<(), ImageError> {
            if path.exists() {
                Ok(())
            } else {
                Err(ImageError::NotFound(path.display().to_string()))
            }
        }

        async fn info(&self, path: &Path) -> Result<ImageInfo, ImageError> {
            Ok(ImageInfo {
                path: path.display().to_string(),
                format: "qcow2".into(),
                logical_size: 0,
                physical_size: 0,
                backing_file: self.backings.lock().get(&path.display().to_string()).cloned(),
            })
        }

        async fn delete_if_leaf(&self, path: &Path) -> Result<(), ImageError> {
            let children = self
                .backings
                .lock()
                .values()
                .filter(|parent| parent.as_str() == path.display().to_string())
                .count();
            if children > 0 {
                return Err(ImageError::CommandFailed {
                    command: "delete-if-leaf".into(),
                    stderr: "image has children".into(),
                });
            }
            tokio::fs::remove_file(path).await?;
            Ok(())
        }
    }

    /// In-memory supervisor: hands out fake PIDs, tracks running ports.
    struct FakeSupervisor {
        running: SyncMutex<HashMap<u16, u32>>,
        next_pid: AtomicU32,
        fail_start: AtomicBool,
    }

    impl FakeSupervisor {
        fn new() -> Self {
            Self {
                running: SyncMutex::new(HashMap::new()),
                next_pid: AtomicU32::new(4000),
                fail_start: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ImageServerSupervisor for FakeSupervisor {
        async fn start(&self, spec: &ImageServerSpec) -> Result<u32, ExportError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ExportError::ImageServerFailed("simulated".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.running.lock().insert(spec.port, pid);
            Ok(pid)
        }

        async fn stop(&self, port: u16) -> Result<(), ExportError> {
            self.running.lock().remove(&port);
            Ok(())
        }

        async fn running_ports(&self) -> Vec<u16> {
            self.running.lock().keys().copied().collect()
        }

        async fn find_orphans(&self) -> Result<Vec<OrphanProcess>, ExportError> {
            Ok(Vec::new())
        }

        async fn kill_pid(&self, _pid: u32) -> Result<(), ExportError> {
            Ok(())
        }
    }

    /// Agent stub recording every replicate call.
    struct FakeAgent {
        requests: SyncMutex<Vec<ReplicationRequest>>,
        fail: AtomicBool,
        cancels: SyncMutex<Vec<String>>,
    }

    impl FakeAgent {
        fn new() -> Self {
            Self {
                requests: SyncMutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                cancels: SyncMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CaptureAgent for FakeAgent {
        async fn replicate(&self, request: &ReplicationRequest) -> Result<(), WorkflowError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WorkflowError::AgentUnreachable("simulated".into()));
            }
            self.requests.lock().push(request.clone());
            Ok(())
        }

        async fn cancel(&self, job_id: &str) {
            self.cancels.lock().push(job_id.to_string());
        }
    }

    struct Harness {
        engine: Arc<BackupWorkflowEngine>,
        agent: Arc<FakeAgent>,
        supervisor: Arc<FakeSupervisor>,
        ports: Arc<PortAllocator>,
        pool: Pool<Sqlite>,
        _root: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with_policy(None).await
    }

    async fn harness_with_policy(min_retention_days: Option<i64>) -> Harness {
        let pool = test_pool().await;
        let root = tempfile::tempdir().unwrap();

        sqlx::query(
            "INSERT INTO repositories (
                name, repo_type, config, min_retention_days, grace_period_days, created_at
             ) VALUES ('r1', 'local', ?, ?, ?, ?)",
        )
        .bind(format!("{{\"root\":\"{}\"}}", root.path().display()))
        .bind(min_retention_days)
        .bind(min_retention_days.map(|_| 1i64))
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let driver: Arc<dyn ImageDriver> = Arc::new(FileDriver::new());
        let repositories = Arc::new(RepositoryManager::new(pool.clone(), driver.clone()));
        let chains = Arc::new(ChainManager::new(pool.clone(), driver));
        let ports = Arc::new(PortAllocator::new(10100..10200));
        let supervisor = Arc::new(FakeSupervisor::new());
        let broker = Arc::new(ExportBroker::new(
            pool.clone(),
            ports.clone(),
            supervisor.clone(),
        ));
        let agent = Arc::new(FakeAgent::new());
        let tracker = Arc::new(JobTracker::with_default_sinks(pool.clone()));

        let engine = Arc::new(BackupWorkflowEngine::new(
            pool.clone(),
            repositories,
            chains,
            broker,
            agent.clone(),
            tracker,
            EngineSettings::default(),
        ));

        Harness {
            engine,
            agent,
            supervisor,
            ports,
            pool,
            _root: root,
        }
    }

    fn full_request(disks: Vec<DiskRequest>) -> BackupRequest {
        BackupRequest {
            vm_name: "pgtest1".into(),
            repository_id: 1,
            backup_type: BackupType::Full,
            hypervisor: HypervisorTarget {
                vcenter: "vc.local".into(),
                username: "administrator".into(),
                password: "secret".into(),
                vm_path: "/Datacenter/vm/pgtest1".into(),
            },
            disks,
        }
    }

    fn two_disks() -> Vec<DiskRequest> {
        vec![
            DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 109_521_666_048,
                previous_change_id: None,
            },
            DiskRequest {
                disk_index: 1,
                source_disk_key: "2001".into(),
                size_bytes: 5_368_709_120,
                previous_change_id: None,
            },
        ]
    }

    #[tokio::test]
    async fn full_then_incremental_two_disk_vm() {
        let h = harness().await;

        // Full backup of both disks
        let started = h.engine.start_backup(full_request(two_disks())).await.unwrap();
        assert_eq!(started.disks.len(), 2);
        let ports: Vec<u16> = started.disks.iter().map(|d| d.port).collect();
        assert_ne!(ports[0], ports[1]);
        assert!(ports.iter().all(|p| (10100..10200).contains(p)));
        assert_eq!(h.agent.requests.lock().len(), 1);

        // Both image files exist
        for disk in &started.disks {
            assert!(Path::new(&disk.image_path).exists());
        }

        // Completion callbacks from the (simulated) agent
        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 109_521_666_048)
            .await
            .unwrap();
        h.engine
            .complete_disk(started.job_id, 1, "cm-A1", 2_684_354_560)
            .await
            .unwrap();

        let (job, disks, (completed, total)) = h.engine.job_overview(started.job_id).await.unwrap();
        assert_eq!(job.status, job_status::COMPLETED);
        assert_eq!((completed, total), (2, 2));
        assert_eq!(job.bytes_transferred, 112_206_020_608);
        assert!(disks.iter().all(|d| d.status == disk_status::COMPLETED));
        assert!(disks.iter().all(|d| d.chain_id.is_some()));

        // Exports and ports are gone; property 3 (port uniqueness) holds
        assert!(h.ports.allocated_ports().is_empty());
        assert!(h.supervisor.running_ports().await.is_empty());

        // Both chains exist with the full as root and head
        for disk in &disks {
            let chain = sqlx::query_as::<_, crate::models::chain::BackupChain>(
                "SELECT * FROM backup_chains WHERE id = ?",
            )
            .bind(disk.chain_id.unwrap())
            .fetch_one(&h.pool)
            .await
            .unwrap();
            assert_eq!(chain.total_backups, 1);
            assert_eq!(chain.latest_backup_id, disk.id);
            assert_eq!(chain.full_backup_id, disk.id);
        }

        // Incremental against the chain heads
        let mut incr = full_request(vec![
            DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 109_521_666_048,
                previous_change_id: Some("cm-A0".into()),
            },
            DiskRequest {
                disk_index: 1,
                source_disk_key: "2001".into(),
                size_bytes: 5_368_709_120,
                previous_change_id: Some("cm-A1".into()),
            },
        ]);
        incr.backup_type = BackupType::Incremental;

        let second = h.engine.start_backup(incr).await.unwrap();
        h.engine
            .complete_disk(second.job_id, 0, "cm-B0", 214_748_364)
            .await
            .unwrap();
        h.engine
            .complete_disk(second.job_id, 1, "cm-B1", 134_217_728)
            .await
            .unwrap();

        let (job2, disks2, _) = h.engine.job_overview(second.job_id).await.unwrap();
        assert_eq!(job2.status, job_status::COMPLETED);

        for (old, new) in disks.iter().zip(disks2.iter()) {
            // Backing link points at the corresponding full image
            assert_eq!(new.parent_image_path.as_deref(), Some(old.image_path.as_str()));
            let chain = sqlx::query_as::<_, crate::models::chain::BackupChain>(
                "SELECT * FROM backup_chains WHERE id = ?",
            )
            .bind(new.chain_id.unwrap())
            .fetch_one(&h.pool)
            .await
            .unwrap();
            assert_eq!(chain.total_backups, 2);
            assert_eq!(chain.latest_backup_id, new.id);
            assert_eq!(chain.full_backup_id, old.id);
        }
    }

    #[tokio::test]
    async fn incremental_with_missing_parent_leaves_nothing_behind() {
        let h = harness().await;

        let mut request = full_request(vec![DiskRequest {
            disk_index: 0,
            source_disk_key: "2000".into(),
            size_bytes: 1024,
            previous_change_id: Some("cm-stale".into()),
        }]);
        request.vm_name = "pgtest2".into();
        request.backup_type = BackupType::Incremental;

        let err = h.engine.start_backup(request).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ParentMissing(_)));

        // No rows inserted, no ports allocated
        let jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_jobs")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(jobs, 0);
        assert!(h.ports.allocated_ports().is_empty());
        assert_eq!(h.agent.requests.lock().len(), 0);
    }

    #[tokio::test]
    async fn incremental_without_marker_fails_validation() {
        let h = harness().await;
        let mut request = full_request(vec![DiskRequest {
            disk_index: 0,
            source_disk_key: "2000".into(),
            size_bytes: 1024,
            previous_change_id: None,
        }]);
        request.backup_type = BackupType::Incremental;

        let err = h.engine.start_backup(request).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Validation(_)));
    }

    #[tokio::test]
    async fn stale_marker_is_an_overlapping_incremental() {
        let h = harness().await;
        let started = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap();
        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();

        let mut stale = full_request(vec![DiskRequest {
            disk_index: 0,
            source_disk_key: "2000".into(),
            size_bytes: 1024,
            previous_change_id: Some("cm-OLD".into()),
        }]);
        stale.backup_type = BackupType::Incremental;

        let err = h.engine.start_backup(stale).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn concurrent_completions_serialize_on_the_chain_head() {
        let h = harness().await;

        // Seed the chain with a completed full
        let full = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap();
        h.engine
            .complete_disk(full.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();

        // Two incrementals started back to back; both pass the marker check
        // against the same head before either finishes
        let mut incr = full_request(vec![DiskRequest {
            disk_index: 0,
            source_disk_key: "2000".into(),
            size_bytes: 1024,
            previous_change_id: Some("cm-A0".into()),
        }]);
        incr.backup_type = BackupType::Incremental;
        let first = h.engine.start_backup(incr.clone()).await.unwrap();
        let second = h.engine.start_backup(incr).await.unwrap();

        // Their completion callbacks race into finalization
        let (a, b) = tokio::join!(
            h.engine.complete_disk(first.job_id, 0, "cm-B0", 64),
            h.engine.complete_disk(second.job_id, 0, "cm-C0", 64),
        );
        a.unwrap();
        b.unwrap();

        // Neither append clobbered the other: the count advanced once per
        // job, both members are attached, and the head is whichever racer's
        // compare-and-set landed last
        let chain = sqlx::query_as::<_, crate::models::chain::BackupChain>(
            "SELECT * FROM backup_chains WHERE context_id = ? AND disk_index = 0",
        )
        .bind(full.context_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
        assert_eq!(chain.total_backups, 3);
        assert_eq!(chain.total_size_bytes, 512 + 64 + 64);

        let first_disk = backup_queries::get_disk(&h.pool, first.job_id, 0)
            .await
            .unwrap()
            .unwrap();
        let second_disk = backup_queries::get_disk(&h.pool, second.job_id, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(
            chain.latest_backup_id == first_disk.id || chain.latest_backup_id == second_disk.id
        );
        assert_eq!(first_disk.chain_id, Some(chain.id));
        assert_eq!(second_disk.chain_id, Some(chain.id));
    }

    #[tokio::test]
    async fn second_full_against_existing_chain_conflicts() {
        let h = harness().await;
        let started = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap();
        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();

        let err = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));
    }

    #[tokio::test]
    async fn disk_failure_fails_the_job_and_keeps_sibling_images() {
        let h = harness().await;
        let started = h.engine.start_backup(full_request(two_disks())).await.unwrap();

        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();
        h.engine
            .fail_disk(started.job_id, 1, "stream interrupted")
            .await
            .unwrap();

        let (job, disks, _) = h.engine.job_overview(started.job_id).await.unwrap();
        assert_eq!(job.status, job_status::FAILED);
        assert!(job.error_message.as_deref().unwrap().contains("disk 1"));

        // Completed sibling keeps its image but is not chain-appended
        let completed = disks.iter().find(|d| d.disk_index == 0).unwrap();
        assert_eq!(completed.status, disk_status::COMPLETED);
        assert!(completed.chain_id.is_none());
        assert!(Path::new(&completed.image_path).exists());

        // All exports torn down
        assert!(h.ports.allocated_ports().is_empty());
        assert!(h.supervisor.running_ports().await.is_empty());

        let chains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_chains")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(chains, 0);
    }

    #[tokio::test]
    async fn duplicate_completion_callback_is_harmless() {
        let h = harness().await;
        let started = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap();

        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();
        // The job is terminal now, so a replayed callback conflicts
        let err = h
            .engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict(_)));

        let chains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_chains")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(chains, 1);
    }

    #[tokio::test]
    async fn agent_failure_rolls_back_every_prepared_disk() {
        let h = harness().await;
        h.agent.fail.store(true, Ordering::SeqCst);

        let err = h
            .engine
            .start_backup(full_request(two_disks()))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AgentUnreachable(_)));

        let (job, disks, _) = {
            let job_id: i64 = sqlx::query_scalar("SELECT MAX(id) FROM backup_jobs")
                .fetch_one(&h.pool)
                .await
                .unwrap();
            h.engine.job_overview(job_id).await.unwrap()
        };
        assert_eq!(job.status, job_status::FAILED);
        assert!(disks.is_empty());
        assert!(h.ports.allocated_ports().is_empty());
        assert!(h.supervisor.running_ports().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_tears_down_and_rolls_back_images() {
        let h = harness().await;
        let started = h.engine.start_backup(full_request(two_disks())).await.unwrap();

        h.engine.cancel_job(started.job_id).await.unwrap();

        let (job, disks, _) = h.engine.job_overview(started.job_id).await.unwrap();
        assert_eq!(job.status, job_status::CANCELLED);
        assert_eq!(h.agent.cancels.lock().len(), 1);
        assert!(h.ports.allocated_ports().is_empty());
        for disk in &disks {
            assert!(!Path::new(&disk.image_path).exists());
        }
    }

    #[tokio::test]
    async fn restart_recovery_orphans_running_jobs() {
        let h = harness().await;
        let started = h.engine.start_backup(full_request(two_disks())).await.unwrap();
        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();

        // Simulate the restart: a fresh engine over the same pool sees the
        // running job with no supervised processes.
        h.engine.recover_interrupted_jobs().await.unwrap();

        let (job, disks, _) = h.engine.job_overview(started.job_id).await.unwrap();
        assert_eq!(job.status, job_status::FAILED);
        assert_eq!(job.error_message.as_deref(), Some("orphaned by restart"));

        let done = disks.iter().find(|d| d.disk_index == 0).unwrap();
        let undone = disks.iter().find(|d| d.disk_index == 1).unwrap();
        // Completed disk's image remains but is not appended to any chain
        assert!(Path::new(&done.image_path).exists());
        assert!(done.chain_id.is_none());
        // In-flight disk is failed and its image removed
        assert_eq!(undone.status, disk_status::FAILED);
        assert!(!Path::new(&undone.image_path).exists());

        assert!(h.ports.allocated_ports().is_empty());

        let exports: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nbd_exports")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(exports, 0);
    }

    #[tokio::test]
    async fn delete_backup_enforces_retention_and_leaf_order() {
        let h = harness_with_policy(Some(7)).await;
        let started = h
            .engine
            .start_backup(full_request(vec![DiskRequest {
                disk_index: 0,
                source_disk_key: "2000".into(),
                size_bytes: 1024,
                previous_change_id: None,
            }]))
            .await
            .unwrap();
        h.engine
            .complete_disk(started.job_id, 0, "cm-A0", 512)
            .await
            .unwrap();

        // Two days old: retention still holds
        sqlx::query("UPDATE backup_jobs SET created_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::days(2))
            .bind(started.job_id)
            .execute(&h.pool)
            .await
            .unwrap();
        let err = h.engine.delete_backup(started.job_id).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::Repository(crate::repository::RepositoryError::RetentionLocked(_))
        ));

        // Day 8: delete succeeds and the chain disappears with its last leaf
        sqlx::query("UPDATE backup_jobs SET created_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::days(8))
            .bind(started.job_id)
            .execute(&h.pool)
            .await
            .unwrap();
        h.engine.delete_backup(started.job_id).await.unwrap();

        let chains: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backup_chains")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(chains, 0);
        assert!(h.engine.job_overview(started.job_id).await.is_err());
    }
}

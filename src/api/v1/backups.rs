use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::sync::Arc;

use crate::api::auth::ApiUser;
use crate::api::error::ApiError;
use crate::chain::ChainManager;
use crate::db::queries::backup as backup_queries;
use crate::models::backup::BackupType;
use crate::restore::RestoreMountManager;
use crate::workflow::{BackupRequest, BackupWorkflowEngine, DiskRequest, HypervisorTarget};

/// Body of POST /backups.
#[derive(Debug, Deserialize)]
pub struct StartBackupBody {
    pub vm_name: String,
    pub repository_id: i64,
    pub backup_type: String,
    pub hypervisor: HypervisorTarget,
    pub disks: Vec<DiskBody>,
}

#[derive(Debug, Deserialize)]
pub struct DiskBody {
    pub disk_index: i64,
    pub source_disk_key: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub previous_change_id: Option<String>,
}

/// Start a VM backup. For incrementals, previous change markers omitted by
/// the caller are resolved from the chain heads before the workflow runs.
#[post("/backups", format = "json", data = "<body>")]
pub async fn start_backup(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    chains: &State<Arc<ChainManager>>,
    pool: &State<Pool<Sqlite>>,
    body: Json<StartBackupBody>,
) -> Result<Json<Value>, ApiError> {
    let body = body.into_inner();
    let backup_type = BackupType::from_str(&body.backup_type)
        .map_err(ApiError::bad_request)?;

    let mut disks: Vec<DiskRequest> = body
        .disks
        .into_iter()
        .map(|d| DiskRequest {
            disk_index: d.disk_index,
            source_disk_key: d.source_disk_key,
            size_bytes: d.size_bytes,
            previous_change_id: d.previous_change_id,
        })
        .collect();

    if backup_type == BackupType::Incremental {
        resolve_markers_from_chains(pool, chains, &body.vm_name, body.repository_id, &mut disks)
            .await?;
    }

    let started = engine
        .start_backup(BackupRequest {
            vm_name: body.vm_name,
            repository_id: body.repository_id,
            backup_type,
            hypervisor: body.hypervisor,
            disks,
        })
        .await?;

    Ok(Json(json!({
        "job_id": started.job_id,
        "context_id": started.context_id,
        "backup_type": started.backup_type,
        "disks": started.disks,
    })))
}

/// Fill in markers the caller left blank from the current chain heads.
async fn resolve_markers_from_chains(
    pool: &Pool<Sqlite>,
    chains: &Arc<ChainManager>,
    vm_name: &str,
    repository_id: i64,
    disks: &mut [DiskRequest],
) -> Result<(), ApiError> {
    let context = sqlx::query_as::<_, crate::models::backup::BackupContext>(
        "SELECT * FROM backup_contexts WHERE vm_name = ? AND repository_id = ?",
    )
    .bind(vm_name)
    .bind(repository_id)
    .fetch_optional(pool)
    .await?;

    let context = match context {
        Some(ctx) => ctx,
        // No context means no chains; the engine reports ParentMissing
        None => return Ok(()),
    };

    for disk in disks.iter_mut() {
        if disk.previous_change_id.is_some() {
            continue;
        }
        if let Some(chain) = chains.get_chain(context.id, disk.disk_index).await? {
            if let Some(head) = backup_queries::get_disk_by_id(pool, chain.latest_backup_id).await?
            {
                disk.previous_change_id = head.change_id;
            }
        }
    }
    Ok(())
}

/// Job, per-disk status, and aggregate progress.
#[get("/backups/<job_id>")]
pub async fn get_backup(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    job_id: i64,
) -> Result<Json<Value>, ApiError> {
    let (job, disks, (completed, total)) = engine.job_overview(job_id).await?;
    Ok(Json(json!({
        "job": job,
        "disks": disks,
        "progress": {
            "completed_disks": completed,
            "total_disks": total,
        }
    })))
}

/// Backup history for a VM
#[get("/backups?<vm_name>&<page>&<per_page>")]
pub async fn list_backups(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    vm_name: String,
    page: Option<i64>,
    per_page: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    let page = page.unwrap_or(1);
    let per_page = per_page.unwrap_or(20);
    let jobs = backup_queries::list_jobs_by_vm(pool, &vm_name, page, per_page).await?;
    Ok(Json(json!({
        "backups": jobs,
        "page": page,
        "per_page": per_page,
    })))
}

/// Ordered chain listing for one disk of a VM
#[get("/backups/chain?<vm_name>&<disk_index>&<repository_id>")]
pub async fn get_backup_chain(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    chains: &State<Arc<ChainManager>>,
    vm_name: String,
    disk_index: i64,
    repository_id: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    // Without an explicit repository the newest context for the VM wins
    let context = match repository_id {
        Some(repo) => {
            sqlx::query_as::<_, crate::models::backup::BackupContext>(
                "SELECT * FROM backup_contexts WHERE vm_name = ? AND repository_id = ?",
            )
            .bind(&vm_name)
            .bind(repo)
            .fetch_optional(&**pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, crate::models::backup::BackupContext>(
                "SELECT * FROM backup_contexts WHERE vm_name = ? ORDER BY id DESC LIMIT 1",
            )
            .bind(&vm_name)
            .fetch_optional(&**pool)
            .await?
        }
    }
    .ok_or_else(|| ApiError::not_found(format!("no backups for {}", vm_name)))?;

    let chain = chains
        .get_chain(context.id, disk_index)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("no chain for {} disk {}", vm_name, disk_index))
        })?;
    let members = chains.list_members(chain.id).await?;

    Ok(Json(json!({
        "chain": chain,
        "members": members,
    })))
}

/// Validate a chain end to end: structure, parent pointers, and on-disk
/// image integrity.
#[get("/backups/chain/validate?<vm_name>&<disk_index>&<repository_id>")]
pub async fn validate_backup_chain(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    chains: &State<Arc<ChainManager>>,
    vm_name: String,
    disk_index: i64,
    repository_id: Option<i64>,
) -> Result<Json<Value>, ApiError> {
    let context = match repository_id {
        Some(repo) => {
            sqlx::query_as::<_, crate::models::backup::BackupContext>(
                "SELECT * FROM backup_contexts WHERE vm_name = ? AND repository_id = ?",
            )
            .bind(&vm_name)
            .bind(repo)
            .fetch_optional(&**pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, crate::models::backup::BackupContext>(
                "SELECT * FROM backup_contexts WHERE vm_name = ? ORDER BY id DESC LIMIT 1",
            )
            .bind(&vm_name)
            .fetch_optional(&**pool)
            .await?
        }
    }
    .ok_or_else(|| ApiError::not_found(format!("no backups for {}", vm_name)))?;

    let chain = chains
        .get_chain(context.id, disk_index)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(format!("no chain for {} disk {}", vm_name, disk_index))
        })?;

    chains.validate_chain(chain.id).await?;
    Ok(Json(json!({ "chain_id": chain.id, "valid": true })))
}

#[derive(Debug, Deserialize)]
pub struct CompleteDiskBody {
    pub disk_index: i64,
    pub change_id: String,
    pub bytes_transferred: i64,
}

/// Internal: per-disk completion callback from the capture agent.
#[post("/backups/<job_id>/complete", format = "json", data = "<body>")]
pub async fn complete_backup_disk(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    job_id: i64,
    body: Json<CompleteDiskBody>,
) -> Result<Json<Value>, ApiError> {
    engine
        .complete_disk(
            job_id,
            body.disk_index,
            &body.change_id,
            body.bytes_transferred,
        )
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct FailDiskBody {
    pub disk_index: i64,
    pub reason: String,
}

/// Internal: per-disk failure callback from the capture agent.
#[post("/backups/<job_id>/fail", format = "json", data = "<body>")]
pub async fn fail_backup_disk(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    job_id: i64,
    body: Json<FailDiskBody>,
) -> Result<Json<Value>, ApiError> {
    engine.fail_disk(job_id, body.disk_index, &body.reason).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
pub struct TelemetryBody {
    pub bytes_transferred: i64,
}

/// Internal: periodic byte-count telemetry from the capture agent. A
/// non-zero telemetry total is authoritative over per-disk aggregation at
/// completion time.
#[post("/backups/<job_id>/telemetry", format = "json", data = "<body>")]
pub async fn record_backup_telemetry(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    job_id: i64,
    body: Json<TelemetryBody>,
) -> Result<Json<Value>, ApiError> {
    backup_queries::get_job_by_id(pool, job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("backup job {}", job_id)))?;
    backup_queries::set_job_bytes(pool, job_id, body.bytes_transferred).await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Cancel a running backup job.
#[post("/backups/<job_id>/cancel")]
pub async fn cancel_backup(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    job_id: i64,
) -> Result<Json<Value>, ApiError> {
    engine.cancel_job(job_id).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

/// Delete a backup. Restore mounts referencing its disks are torn down at
/// the OS level first; immutability and chain dependency rules then apply.
#[delete("/backups/<job_id>")]
pub async fn delete_backup(
    _user: ApiUser,
    engine: &State<Arc<BackupWorkflowEngine>>,
    mounts: &State<Arc<RestoreMountManager>>,
    pool: &State<Pool<Sqlite>>,
    job_id: i64,
) -> Result<Json<Value>, ApiError> {
    for disk in backup_queries::list_disks_for_job(pool, job_id).await? {
        mounts.teardown_for_disk(disk.id).await?;
    }
    engine.delete_backup(job_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

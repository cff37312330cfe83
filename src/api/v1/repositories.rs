use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, put, State};
use serde::Deserialize;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

use crate::api::auth::ApiUser;
use crate::api::error::ApiError;
use crate::db::queries::repository as repo_queries;
use crate::models::repository::{repo_type, RepositoryConfig};
use crate::repository::RepositoryManager;

/// Body of POST /repositories.
#[derive(Debug, Deserialize)]
pub struct CreateRepositoryBody {
    pub name: String,
    pub repo_type: String,
    pub config: RepositoryConfig,
    #[serde(default)]
    pub min_retention_days: Option<i64>,
    #[serde(default)]
    pub grace_period_days: Option<i64>,
    #[serde(default = "default_true")]
    pub apply_to_full_backups: bool,
    #[serde(default)]
    pub apply_to_incrementals: bool,
}

fn default_true() -> bool {
    true
}

/// List all repositories with their capacity snapshots.
#[get("/repositories")]
pub async fn list_repositories(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
) -> Result<Json<Value>, ApiError> {
    let repositories = repo_queries::list_repositories(pool).await?;
    Ok(Json(json!({ "repositories": repositories })))
}

/// Get one repository.
#[get("/repositories/<repository_id>")]
pub async fn get_repository(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    repository_id: i64,
) -> Result<Json<Value>, ApiError> {
    let repository = repo_queries::get_repository_by_id(pool, repository_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository {}", repository_id)))?;
    Ok(Json(json!({ "repository": repository })))
}

/// Register a repository and take an initial capacity snapshot.
#[post("/repositories", format = "json", data = "<body>")]
pub async fn create_repository(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    manager: &State<Arc<RepositoryManager>>,
    body: Json<CreateRepositoryBody>,
) -> Result<Json<Value>, ApiError> {
    let body = body.into_inner();

    match body.repo_type.as_str() {
        repo_type::LOCAL | repo_type::NFS | repo_type::OBJECT => {}
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown repository type: {}",
                other
            )))
        }
    }
    if body.repo_type == repo_type::NFS && body.config.nfs_export.is_none() {
        return Err(ApiError::bad_request("nfs repository requires nfs_export"));
    }

    if repo_queries::get_repository_by_name(pool, &body.name)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict(format!(
            "repository name {} is already in use",
            body.name
        )));
    }

    let config = serde_json::to_string(&body.config)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let repository = repo_queries::create_repository(
        pool,
        repo_queries::NewRepository {
            name: &body.name,
            repo_type: &body.repo_type,
            config: &config,
            min_retention_days: body.min_retention_days,
            grace_period_days: body.grace_period_days,
            apply_to_full_backups: body.apply_to_full_backups,
            apply_to_incrementals: body.apply_to_incrementals,
        },
    )
    .await?;

    if let Err(e) = manager.refresh_capacity(repository.id).await {
        log::warn!("Initial capacity snapshot for {} failed: {}", repository.id, e);
    }

    Ok(Json(json!({ "repository": repository })))
}

#[derive(Debug, Deserialize)]
pub struct EnableBody {
    pub enabled: bool,
}

/// Soft-enable or disable a repository. Disabled repositories refuse new
/// backups but keep their images.
#[put("/repositories/<repository_id>/enabled", format = "json", data = "<body>")]
pub async fn set_repository_enabled(
    _user: ApiUser,
    pool: &State<Pool<Sqlite>>,
    manager: &State<Arc<RepositoryManager>>,
    repository_id: i64,
    body: Json<EnableBody>,
) -> Result<Json<Value>, ApiError> {
    repo_queries::get_repository_by_id(pool, repository_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repository {}", repository_id)))?;

    repo_queries::set_repository_enabled(pool, repository_id, body.enabled).await?;
    manager.invalidate(repository_id).await;
    Ok(Json(json!({ "status": "ok", "enabled": body.enabled })))
}

/// Delete a repository. Blocked while any backup still references it.
#[delete("/repositories/<repository_id>")]
pub async fn delete_repository(
    _user: ApiUser,
    manager: &State<Arc<RepositoryManager>>,
    repository_id: i64,
) -> Result<Json<Value>, ApiError> {
    manager.delete_repository(repository_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

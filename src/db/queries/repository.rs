use crate::models::repository::Repository;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

/// List all configured repositories
pub async fn list_repositories(pool: &Pool<Sqlite>) -> Result<Vec<Repository>, sqlx::Error> {
    let repositories = sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY id")
        .fetch_all(pool)
        .await?;
    tracing::info!("Query returned {} repositories", repositories.len());
    Ok(repositories)
}

/// Get a repository by ID
pub async fn get_repository_by_id(
    pool: &Pool<Sqlite>,
    repository_id: i64,
) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(repository_id)
        .fetch_optional(pool)
        .await
}

/// Get a repository by its unique name
pub async fn get_repository_by_name(
    pool: &Pool<Sqlite>,
    name: &str,
) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
}

/// Parameters for creating a repository row
pub struct NewRepository<'a> {
    pub name: &'a str,
    pub repo_type: &'a str,
    pub config: &'a str,
    pub min_retention_days: Option<i64>,
    pub grace_period_days: Option<i64>,
    pub apply_to_full_backups: bool,
    pub apply_to_incrementals: bool,
}

/// Create a new repository
pub async fn create_repository(
    pool: &Pool<Sqlite>,
    new: NewRepository<'_>,
) -> Result<Repository, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO repositories (
            name, repo_type, config, enabled, min_retention_days, grace_period_days,
            apply_to_full_backups, apply_to_incrementals, created_at
        ) VALUES (?, ?, ?, 1, ?, ?, ?, ?, ?)",
    )
    .bind(new.name)
    .bind(new.repo_type)
    .bind(new.config)
    .bind(new.min_retention_days)
    .bind(new.grace_period_days)
    .bind(new.apply_to_full_backups)
    .bind(new.apply_to_incrementals)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Enable or soft-disable a repository
pub async fn set_repository_enabled(
    pool: &Pool<Sqlite>,
    repository_id: i64,
    enabled: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE repositories SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(repository_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Refresh the capacity snapshot for a repository
pub async fn update_capacity(
    pool: &Pool<Sqlite>,
    repository_id: i64,
    total_bytes: i64,
    used_bytes: i64,
    available_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE repositories SET total_bytes = ?, used_bytes = ?, available_bytes = ? WHERE id = ?",
    )
    .bind(total_bytes)
    .bind(used_bytes)
    .bind(available_bytes)
    .bind(repository_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a repository row. Callers must first check that no backup still
/// references it.
pub async fn delete_repository(
    pool: &Pool<Sqlite>,
    repository_id: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM repositories WHERE id = ?")
        .bind(repository_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Count backup disks that still reference this repository through their
/// backup context
pub async fn count_backups_for_repository(
    pool: &Pool<Sqlite>,
    repository_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_disks d
         JOIN backup_jobs j ON j.id = d.job_id
         JOIN backup_contexts c ON c.id = j.context_id
         WHERE c.repository_id = ?",
    )
    .bind(repository_id)
    .fetch_one(pool)
    .await
}

use crate::db_manager::error::DatabaseError;
use log::info;
use sqlx::{Pool, Sqlite};
use std::env;

/// Manages database schema migrations
pub struct MigrationManager;

/// DDL for schema version 1, applied statement by statement.
///
/// Chain members are backup_disks rows; a disk joins its chain when the
/// workflow appends it after completion, which is why `chain_id` is nullable.
const SCHEMA_V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        repo_type TEXT NOT NULL,
        config TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        min_retention_days INTEGER,
        grace_period_days INTEGER,
        apply_to_full_backups INTEGER NOT NULL DEFAULT 1,
        apply_to_incrementals INTEGER NOT NULL DEFAULT 0,
        total_bytes INTEGER NOT NULL DEFAULT 0,
        used_bytes INTEGER NOT NULL DEFAULT 0,
        available_bytes INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS backup_contexts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        vm_name TEXT NOT NULL,
        repository_id INTEGER NOT NULL REFERENCES repositories(id),
        created_at TEXT NOT NULL,
        successful_count INTEGER NOT NULL DEFAULT 0,
        last_backup_id INTEGER,
        last_backup_type TEXT,
        last_backup_at TEXT,
        UNIQUE (vm_name, repository_id)
    )",
    "CREATE TABLE IF NOT EXISTS backup_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        context_id INTEGER NOT NULL REFERENCES backup_contexts(id),
        vm_name TEXT NOT NULL,
        backup_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TEXT NOT NULL,
        completed_at TEXT,
        bytes_transferred INTEGER NOT NULL DEFAULT 0,
        error_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS backup_chains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        context_id INTEGER NOT NULL REFERENCES backup_contexts(id),
        disk_index INTEGER NOT NULL,
        full_backup_id INTEGER NOT NULL,
        latest_backup_id INTEGER NOT NULL,
        total_backups INTEGER NOT NULL DEFAULT 1,
        total_size_bytes INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (context_id, disk_index)
    )",
    "CREATE TABLE IF NOT EXISTS backup_disks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
        chain_id INTEGER REFERENCES backup_chains(id),
        disk_index INTEGER NOT NULL,
        source_disk_key TEXT NOT NULL,
        image_path TEXT NOT NULL,
        change_id TEXT,
        parent_image_path TEXT,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        bytes_transferred INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        completed_at TEXT,
        UNIQUE (job_id, disk_index)
    )",
    "CREATE TABLE IF NOT EXISTS restore_mounts (
        id TEXT PRIMARY KEY,
        backup_disk_id INTEGER NOT NULL UNIQUE REFERENCES backup_disks(id) ON DELETE CASCADE,
        mount_path TEXT NOT NULL,
        nbd_device TEXT NOT NULL,
        filesystem_type TEXT,
        status TEXT NOT NULL DEFAULT 'mounting',
        created_at TEXT NOT NULL,
        last_accessed_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nbd_exports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES backup_jobs(id) ON DELETE CASCADE,
        backup_disk_id INTEGER NOT NULL REFERENCES backup_disks(id) ON DELETE CASCADE,
        port INTEGER NOT NULL UNIQUE,
        export_name TEXT NOT NULL,
        pid INTEGER,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS tracker_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id TEXT UNIQUE,
        context_id TEXT,
        parent_job_id INTEGER REFERENCES tracker_jobs(id),
        job_type TEXT NOT NULL,
        operation TEXT NOT NULL,
        owner TEXT,
        category TEXT,
        status TEXT NOT NULL DEFAULT 'running',
        percent_complete INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS tracker_steps (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES tracker_jobs(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        name TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error_message TEXT,
        UNIQUE (job_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS tracker_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER REFERENCES tracker_jobs(id) ON DELETE CASCADE,
        step_id INTEGER,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_backup_jobs_context ON backup_jobs(context_id)",
    "CREATE INDEX IF NOT EXISTS idx_backup_disks_job ON backup_disks(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_backup_disks_chain ON backup_disks(chain_id)",
    "CREATE INDEX IF NOT EXISTS idx_nbd_exports_job ON nbd_exports(job_id)",
    "CREATE INDEX IF NOT EXISTS idx_tracker_logs_job ON tracker_logs(job_id)",
];

impl MigrationManager {
    /// Initializes and migrates the main database schema
    pub async fn initialize_main_schema(pool: &Pool<Sqlite>) -> Result<(), DatabaseError> {
        info!("Initializing main database schema...");

        Self::apply_schema(pool).await?;

        let target_version = Self::get_target_schema_version()?;
        let current_version = Self::get_current_schema_version(pool).await?;

        if current_version == target_version {
            info!("Schema version check: OK (version {})", current_version);
            return Ok(());
        }

        Self::set_schema_version(pool, target_version).await?;
        info!(
            "Schema migrated from version {} to {}",
            current_version, target_version
        );
        Ok(())
    }

    /// Gets the target schema version from environment or defaults to 1
    fn get_target_schema_version() -> Result<i64, DatabaseError> {
        let version = env::var("OMNI_VAULT_SCHEMA_VERSION")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<i64>()
            .map_err(|_| DatabaseError::Other("Invalid schema version".into()))?;

        Ok(version)
    }

    /// Gets the current schema version from the database
    async fn get_current_schema_version(pool: &Pool<Sqlite>) -> Result<i64, DatabaseError> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'schema_version'")
                .fetch_optional(pool)
                .await
                .map_err(DatabaseError::SqlxError)?;

        Ok(version
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0))
    }

    /// Records the schema version in the metadata table
    async fn set_schema_version(pool: &Pool<Sqlite>, version: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(version.to_string())
        .execute(pool)
        .await
        .map_err(DatabaseError::SqlxError)?;

        Ok(())
    }

    /// Applies the schema DDL, statement by statement
    async fn apply_schema(pool: &Pool<Sqlite>) -> Result<(), DatabaseError> {
        for statement in SCHEMA_V1 {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| DatabaseError::MigrationError(format!("{}: {}", e, statement)))?;
        }
        Ok(())
    }
}

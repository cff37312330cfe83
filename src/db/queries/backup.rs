use crate::models::backup::{BackupContext, BackupDisk, BackupJob};
use chrono::Utc;
use sqlx::{Pool, Sqlite};

/// Get the backup context for a (VM, repository) pair, creating it on first
/// use.
pub async fn get_or_create_context(
    pool: &Pool<Sqlite>,
    vm_name: &str,
    repository_id: i64,
) -> Result<BackupContext, sqlx::Error> {
    if let Some(ctx) = sqlx::query_as::<_, BackupContext>(
        "SELECT * FROM backup_contexts WHERE vm_name = ? AND repository_id = ?",
    )
    .bind(vm_name)
    .bind(repository_id)
    .fetch_optional(pool)
    .await?
    {
        return Ok(ctx);
    }

    let result = sqlx::query(
        "INSERT INTO backup_contexts (vm_name, repository_id, created_at) VALUES (?, ?, ?)",
    )
    .bind(vm_name)
    .bind(repository_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, BackupContext>("SELECT * FROM backup_contexts WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Get a backup context by ID
pub async fn get_context_by_id(
    pool: &Pool<Sqlite>,
    context_id: i64,
) -> Result<Option<BackupContext>, sqlx::Error> {
    sqlx::query_as::<_, BackupContext>("SELECT * FROM backup_contexts WHERE id = ?")
        .bind(context_id)
        .fetch_optional(pool)
        .await
}

/// Create a new backup job in `pending`
pub async fn create_job(
    pool: &Pool<Sqlite>,
    context_id: i64,
    vm_name: &str,
    backup_type: &str,
) -> Result<BackupJob, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO backup_jobs (context_id, vm_name, backup_type, status, created_at)
         VALUES (?, ?, ?, 'pending', ?)",
    )
    .bind(context_id)
    .bind(vm_name)
    .bind(backup_type)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Get a backup job by ID
pub async fn get_job_by_id(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Option<BackupJob>, sqlx::Error> {
    sqlx::query_as::<_, BackupJob>("SELECT * FROM backup_jobs WHERE id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Backup history for a VM, newest first
pub async fn list_jobs_by_vm(
    pool: &Pool<Sqlite>,
    vm_name: &str,
    page: i64,
    per_page: i64,
) -> Result<Vec<BackupJob>, sqlx::Error> {
    tracing::info!(vm_name = vm_name, page = page, "Fetching backup history");
    sqlx::query_as::<_, BackupJob>(
        "SELECT * FROM backup_jobs WHERE vm_name = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
    )
    .bind(vm_name)
    .bind(per_page)
    .bind((page - 1).max(0) * per_page)
    .fetch_all(pool)
    .await
}

/// Jobs currently in one of the given statuses (startup recovery path)
pub async fn list_jobs_by_statuses(
    pool: &Pool<Sqlite>,
    statuses: &[&str],
) -> Result<Vec<BackupJob>, sqlx::Error> {
    // SQLite has no array binds; the status list is small and fixed
    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        "SELECT * FROM backup_jobs WHERE status IN ({}) ORDER BY id",
        placeholders
    );
    let mut query = sqlx::query_as::<_, BackupJob>(&sql);
    for status in statuses {
        query = query.bind(*status);
    }
    query.fetch_all(pool).await
}

/// Move a job to `running`. Only fires from `pending`.
pub async fn mark_job_running(pool: &Pool<Sqlite>, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_jobs SET status = 'running' WHERE id = ? AND status = 'pending'")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a job terminal with an error message
pub async fn mark_job_failed(
    pool: &Pool<Sqlite>,
    job_id: i64,
    status: &str,
    error_message: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_jobs SET status = ?, error_message = ?, completed_at = ?
         WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(status)
    .bind(error_message)
    .bind(Utc::now())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record telemetry-reported bytes on the job row
pub async fn set_job_bytes(
    pool: &Pool<Sqlite>,
    job_id: i64,
    bytes_transferred: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_jobs SET bytes_transferred = ? WHERE id = ?")
        .bind(bytes_transferred)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Parameters for inserting a backup disk row
pub struct NewBackupDisk<'a> {
    pub job_id: i64,
    pub disk_index: i64,
    pub source_disk_key: &'a str,
    pub image_path: &'a str,
    pub parent_image_path: Option<&'a str>,
    pub size_bytes: i64,
}

/// Insert a backup disk row in `pending`
pub async fn create_disk(
    pool: &Pool<Sqlite>,
    new: NewBackupDisk<'_>,
) -> Result<BackupDisk, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO backup_disks (
            job_id, disk_index, source_disk_key, image_path, parent_image_path,
            size_bytes, status
        ) VALUES (?, ?, ?, ?, ?, ?, 'pending')",
    )
    .bind(new.job_id)
    .bind(new.disk_index)
    .bind(new.source_disk_key)
    .bind(new.image_path)
    .bind(new.parent_image_path)
    .bind(new.size_bytes)
    .execute(pool)
    .await?;

    sqlx::query_as::<_, BackupDisk>("SELECT * FROM backup_disks WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Get a backup disk by ID
pub async fn get_disk_by_id(
    pool: &Pool<Sqlite>,
    disk_id: i64,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>("SELECT * FROM backup_disks WHERE id = ?")
        .bind(disk_id)
        .fetch_optional(pool)
        .await
}

/// Get one disk of a job by its index
pub async fn get_disk(
    pool: &Pool<Sqlite>,
    job_id: i64,
    disk_index: i64,
) -> Result<Option<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? AND disk_index = ?",
    )
    .bind(job_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// All disks of a job ordered by index
pub async fn list_disks_for_job(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE job_id = ? ORDER BY disk_index",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Atomically complete a disk, recording the new changed-block marker.
///
/// The status predicate makes duplicate completion callbacks harmless:
/// the second update matches zero rows.
pub async fn complete_disk(
    pool: &Pool<Sqlite>,
    job_id: i64,
    disk_index: i64,
    change_id: &str,
    bytes_transferred: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_disks
         SET status = 'completed', change_id = ?, bytes_transferred = ?, completed_at = ?
         WHERE job_id = ? AND disk_index = ? AND status IN ('pending', 'running')",
    )
    .bind(change_id)
    .bind(bytes_transferred)
    .bind(Utc::now())
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Mark one disk failed
pub async fn fail_disk(
    pool: &Pool<Sqlite>,
    job_id: i64,
    disk_index: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_disks SET status = 'failed', completed_at = ?
         WHERE job_id = ? AND disk_index = ? AND status IN ('pending', 'running')",
    )
    .bind(Utc::now())
    .bind(job_id)
    .bind(disk_index)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// (completed, total) disk counts for a job
pub async fn disk_counts(pool: &Pool<Sqlite>, job_id: i64) -> Result<(i64, i64), sqlx::Error> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT
            COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
            COUNT(*)
         FROM backup_disks WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Sum of per-disk transferred bytes for a job
pub async fn sum_disk_bytes(pool: &Pool<Sqlite>, job_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COALESCE(SUM(bytes_transferred), 0) FROM backup_disks WHERE job_id = ?",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
}

/// Delete a backup disk row
pub async fn delete_disk(pool: &Pool<Sqlite>, disk_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM backup_disks WHERE id = ?")
        .bind(disk_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Conditionally flip a job to `completed` inside a caller-owned
/// transaction.
///
/// Returns false when another callback already finalized the job (the
/// predicate matched zero rows), which is the exactly-once guard for the
/// completion transition.
pub async fn mark_job_completed_conn(
    conn: &mut sqlx::SqliteConnection,
    job_id: i64,
    bytes_transferred: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_jobs
         SET status = 'completed', completed_at = ?, bytes_transferred = ?
         WHERE id = ? AND status = 'running'",
    )
    .bind(Utc::now())
    .bind(bytes_transferred)
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Update context statistics after a successful job, inside a caller-owned
/// transaction.
pub async fn update_context_stats_conn(
    conn: &mut sqlx::SqliteConnection,
    job_id: i64,
    backup_type: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_contexts
         SET successful_count = successful_count + 1,
             last_backup_id = ?, last_backup_type = ?, last_backup_at = ?
         WHERE id = (SELECT context_id FROM backup_jobs WHERE id = ?)",
    )
    .bind(job_id)
    .bind(backup_type)
    .bind(Utc::now())
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

use crate::models::nbd_export::NbdExport;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

/// Record a live export for crash-recovery visibility
pub async fn create_export(
    pool: &Pool<Sqlite>,
    job_id: i64,
    backup_disk_id: i64,
    port: i64,
    export_name: &str,
    pid: Option<i64>,
) -> Result<NbdExport, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO nbd_exports (job_id, backup_disk_id, port, export_name, pid, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(job_id)
    .bind(backup_disk_id)
    .bind(port)
    .bind(export_name)
    .bind(pid)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(pool)
        .await
}

/// Every export belonging to a job
pub async fn list_exports_for_job(
    pool: &Pool<Sqlite>,
    job_id: i64,
) -> Result<Vec<NbdExport>, sqlx::Error> {
    sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports WHERE job_id = ? ORDER BY port")
        .bind(job_id)
        .fetch_all(pool)
        .await
}

/// Every live export record (startup reconciliation)
pub async fn list_all_exports(pool: &Pool<Sqlite>) -> Result<Vec<NbdExport>, sqlx::Error> {
    sqlx::query_as::<_, NbdExport>("SELECT * FROM nbd_exports ORDER BY port")
        .fetch_all(pool)
        .await
}

/// Drop the record for a torn-down export
pub async fn delete_export_by_port(pool: &Pool<Sqlite>, port: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM nbd_exports WHERE port = ?")
        .bind(port)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

use crate::models::restore_mount::RestoreMount;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

/// Parameters for inserting a restore mount row
pub struct NewRestoreMount<'a> {
    pub id: &'a str,
    pub backup_disk_id: i64,
    pub mount_path: &'a str,
    pub nbd_device: &'a str,
    pub filesystem_type: Option<&'a str>,
    pub expires_at: DateTime<Utc>,
}

/// Insert a restore mount row in `mounting`. Fails with a constraint
/// violation when an active mount already exists for the backup disk.
pub async fn create_mount(
    pool: &Pool<Sqlite>,
    new: NewRestoreMount<'_>,
) -> Result<RestoreMount, sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO restore_mounts (
            id, backup_disk_id, mount_path, nbd_device, filesystem_type,
            status, created_at, last_accessed_at, expires_at
        ) VALUES (?, ?, ?, ?, ?, 'mounting', ?, ?, ?)",
    )
    .bind(new.id)
    .bind(new.backup_disk_id)
    .bind(new.mount_path)
    .bind(new.nbd_device)
    .bind(new.filesystem_type)
    .bind(now)
    .bind(now)
    .bind(new.expires_at)
    .execute(pool)
    .await?;

    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE id = ?")
        .bind(new.id)
        .fetch_one(pool)
        .await
}

/// Get a mount by its opaque id
pub async fn get_mount(
    pool: &Pool<Sqlite>,
    mount_id: &str,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE id = ?")
        .bind(mount_id)
        .fetch_optional(pool)
        .await
}

/// Get the active mount for a backup disk, if any
pub async fn get_mount_by_disk(
    pool: &Pool<Sqlite>,
    backup_disk_id: i64,
) -> Result<Option<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts WHERE backup_disk_id = ?")
        .bind(backup_disk_id)
        .fetch_optional(pool)
        .await
}

/// All active mounts
pub async fn list_mounts(pool: &Pool<Sqlite>) -> Result<Vec<RestoreMount>, sqlx::Error> {
    sqlx::query_as::<_, RestoreMount>("SELECT * FROM restore_mounts ORDER BY created_at")
        .fetch_all(pool)
        .await
}

/// Refresh the last-access timestamp
pub async fn touch_mount(pool: &Pool<Sqlite>, mount_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE restore_mounts SET last_accessed_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(mount_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Update the lifecycle status of a mount
pub async fn update_mount_status(
    pool: &Pool<Sqlite>,
    mount_id: &str,
    status: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE restore_mounts SET status = ? WHERE id = ?")
        .bind(status)
        .bind(mount_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove a mount row
pub async fn delete_mount(pool: &Pool<Sqlite>, mount_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM restore_mounts WHERE id = ?")
        .bind(mount_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

use crate::models::backup::BackupDisk;
use crate::models::chain::BackupChain;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

/// Get the chain for a (context, disk index) pair
pub async fn get_chain(
    pool: &Pool<Sqlite>,
    context_id: i64,
    disk_index: i64,
) -> Result<Option<BackupChain>, sqlx::Error> {
    sqlx::query_as::<_, BackupChain>(
        "SELECT * FROM backup_chains WHERE context_id = ? AND disk_index = ?",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_optional(pool)
    .await
}

/// Get a chain by ID
pub async fn get_chain_by_id(
    pool: &Pool<Sqlite>,
    chain_id: i64,
) -> Result<Option<BackupChain>, sqlx::Error> {
    sqlx::query_as::<_, BackupChain>("SELECT * FROM backup_chains WHERE id = ?")
        .bind(chain_id)
        .fetch_optional(pool)
        .await
}

/// Advance the chain head inside a caller-owned transaction. The predicate
/// on the previous head serializes concurrent appenders: the loser matches
/// zero rows and must re-read `latest` before retrying.
pub async fn advance_chain_head_conn(
    conn: &mut sqlx::SqliteConnection,
    chain_id: i64,
    previous_latest: i64,
    new_latest: i64,
    size_bytes: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE backup_chains
         SET latest_backup_id = ?, total_backups = total_backups + 1,
             total_size_bytes = total_size_bytes + ?, updated_at = ?
         WHERE id = ? AND latest_backup_id = ?",
    )
    .bind(new_latest)
    .bind(size_bytes)
    .bind(Utc::now())
    .bind(chain_id)
    .bind(previous_latest)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Seed a chain inside a caller-owned transaction, returning the new chain id
pub async fn seed_chain_conn(
    conn: &mut sqlx::SqliteConnection,
    context_id: i64,
    disk_index: i64,
    full_backup_id: i64,
    size_bytes: i64,
) -> Result<i64, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO backup_chains (
            context_id, disk_index, full_backup_id, latest_backup_id,
            total_backups, total_size_bytes, created_at, updated_at
        ) VALUES (?, ?, ?, ?, 1, ?, ?, ?)",
    )
    .bind(context_id)
    .bind(disk_index)
    .bind(full_backup_id)
    .bind(full_backup_id)
    .bind(size_bytes)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Attach a disk to its chain inside a caller-owned transaction
pub async fn attach_disk_conn(
    conn: &mut sqlx::SqliteConnection,
    chain_id: i64,
    backup_disk_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_disks SET chain_id = ? WHERE id = ?")
        .bind(chain_id)
        .bind(backup_disk_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Chain lookup inside a caller-owned transaction
pub async fn get_chain_conn(
    conn: &mut sqlx::SqliteConnection,
    context_id: i64,
    disk_index: i64,
) -> Result<Option<BackupChain>, sqlx::Error> {
    sqlx::query_as::<_, BackupChain>(
        "SELECT * FROM backup_chains WHERE context_id = ? AND disk_index = ?",
    )
    .bind(context_id)
    .bind(disk_index)
    .fetch_optional(&mut *conn)
    .await
}

/// Chain lookup by ID inside a caller-owned transaction
pub async fn get_chain_by_id_conn(
    conn: &mut sqlx::SqliteConnection,
    chain_id: i64,
) -> Result<Option<BackupChain>, sqlx::Error> {
    sqlx::query_as::<_, BackupChain>("SELECT * FROM backup_chains WHERE id = ?")
        .bind(chain_id)
        .fetch_optional(&mut *conn)
        .await
}

/// Detach a disk from its chain (leaf removal path)
pub async fn detach_disk_from_chain(
    pool: &Pool<Sqlite>,
    backup_disk_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE backup_disks SET chain_id = NULL WHERE id = ?")
        .bind(backup_disk_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// All members of a chain, oldest first
pub async fn list_backups_for_chain(
    pool: &Pool<Sqlite>,
    chain_id: i64,
) -> Result<Vec<BackupDisk>, sqlx::Error> {
    sqlx::query_as::<_, BackupDisk>(
        "SELECT * FROM backup_disks WHERE chain_id = ? ORDER BY id",
    )
    .bind(chain_id)
    .fetch_all(pool)
    .await
}

/// Number of chain members whose parent image is this backup's image;
/// non-zero means the backup is not a leaf and must not be deleted
pub async fn count_backup_dependencies(
    pool: &Pool<Sqlite>,
    backup_disk_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM backup_disks
         WHERE parent_image_path = (SELECT image_path FROM backup_disks WHERE id = ?)",
    )
    .bind(backup_disk_id)
    .fetch_one(pool)
    .await
}

/// Number of members attached to a chain
pub async fn count_chain_members(
    pool: &Pool<Sqlite>,
    chain_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM backup_disks WHERE chain_id = ?")
        .bind(chain_id)
        .fetch_one(pool)
        .await
}

/// Roll the chain head back to the given member after a leaf delete
pub async fn retreat_chain_head(
    pool: &Pool<Sqlite>,
    chain_id: i64,
    new_latest: i64,
    removed_size_bytes: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE backup_chains
         SET latest_backup_id = ?, total_backups = total_backups - 1,
             total_size_bytes = MAX(total_size_bytes - ?, 0), updated_at = ?
         WHERE id = ?",
    )
    .bind(new_latest)
    .bind(removed_size_bytes)
    .bind(Utc::now())
    .bind(chain_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Delete a chain row. Callers must verify the chain has no members left.
pub async fn delete_chain(pool: &Pool<Sqlite>, chain_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM backup_chains WHERE id = ?")
        .bind(chain_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

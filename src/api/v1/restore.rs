use rocket::fs::NamedFile;
use rocket::http::ContentType;
use rocket::response::stream::ReaderStream;
use rocket::serde::json::{json, Json, Value};
use rocket::{delete, get, post, State};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;

use crate::api::auth::ApiUser;
use crate::api::error::ApiError;
use crate::restore::archive::ArchiveFormat;
use crate::restore::RestoreMountManager;

/// Body of POST /restore/mount.
#[derive(Debug, Deserialize)]
pub struct MountBody {
    pub backup_id: i64,
    pub disk_index: i64,
}

/// Mount a completed backup disk read-only for file-level restore.
#[post("/restore/mount", format = "json", data = "<body>")]
pub async fn mount_backup(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
    body: Json<MountBody>,
) -> Result<Json<Value>, ApiError> {
    let mount = mounts.mount_backup(body.backup_id, body.disk_index).await?;
    Ok(Json(json!({
        "mount_id": mount.id,
        "nbd_device": mount.nbd_device,
        "mount_path": mount.mount_path,
        "filesystem_type": mount.filesystem_type,
        "status": mount.status,
        "expires_at": mount.expires_at,
    })))
}

/// Directory listing inside a mount.
#[get("/restore/<mount_id>/files?<path>")]
pub async fn list_restore_files(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
    mount_id: String,
    path: Option<String>,
) -> Result<Json<Value>, ApiError> {
    let path = path.unwrap_or_default();
    let entries = mounts.list_files(&mount_id, &path).await?;
    Ok(Json(json!({
        "mount_id": mount_id,
        "path": path,
        "entries": entries,
    })))
}

/// Stream one file out of a mount.
#[get("/restore/<mount_id>/download?<path>")]
pub async fn download_restore_file(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
    mount_id: String,
    path: String,
) -> Result<NamedFile, ApiError> {
    let target = mounts.file_for_download(&mount_id, &path).await?;
    NamedFile::open(&target)
        .await
        .map_err(|e| ApiError::internal(format!("cannot open {}: {}", target.display(), e)))
}

/// Stream a directory as an archive built on the fly.
#[get("/restore/<mount_id>/download-directory?<path>&<format>")]
pub async fn download_restore_directory(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
    mount_id: String,
    path: String,
    format: Option<String>,
) -> Result<(ContentType, ReaderStream![tokio::fs::File]), ApiError> {
    let format = ArchiveFormat::from_str(format.as_deref().unwrap_or("zip"))
        .map_err(ApiError::bad_request)?;

    let file = mounts.archive_directory(&mount_id, &path, format).await?;

    let content_type = match format {
        ArchiveFormat::Zip => ContentType::ZIP,
        ArchiveFormat::TarGz => ContentType::new("application", "gzip"),
    };
    Ok((content_type, ReaderStream::one(file)))
}

/// Unmount. Idempotent: a second delete of the same mount also succeeds.
#[delete("/restore/<mount_id>")]
pub async fn unmount_restore(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
    mount_id: String,
) -> Result<Json<Value>, ApiError> {
    mounts.unmount(&mount_id).await?;
    Ok(Json(json!({ "status": "unmounted" })))
}

/// Active mounts.
#[get("/restore/mounts")]
pub async fn list_restore_mounts(
    _user: ApiUser,
    mounts: &State<Arc<RestoreMountManager>>,
) -> Result<Json<Value>, ApiError> {
    let active = mounts.list_mounts().await?;
    Ok(Json(json!({ "mounts": active })))
}

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::queries::backup as backup_queries;
use crate::db::queries::restore_mount as mount_queries;
use crate::models::backup::disk_status;
use crate::models::restore_mount::{mount_status, RestoreMount};

use super::archive::{build_archive, ArchiveFormat};
use super::{MountBackend, NbdDevicePool, RestoreError};

/// Behavior knobs resolved from the server configuration.
#[derive(Debug, Clone)]
pub struct MountSettings {
    pub mount_root: PathBuf,
    pub ttl: Duration,
    pub idle_timeout: Duration,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/omni-vault/restore"),
            ttl: Duration::hours(1),
            idle_timeout: Duration::minutes(30),
        }
    }
}

/// One entry of a directory listing inside a mount.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: i64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Mounts backup images read-only through kernel NBD devices, serves file
/// browsing and downloads, and reaps idle mounts on a timer.
pub struct RestoreMountManager {
    pool: Pool<Sqlite>,
    devices: NbdDevicePool,
    backend: Arc<dyn MountBackend>,
    settings: MountSettings,
}

impl RestoreMountManager {
    pub fn new(
        pool: Pool<Sqlite>,
        devices: NbdDevicePool,
        backend: Arc<dyn MountBackend>,
        settings: MountSettings,
    ) -> Self {
        Self {
            pool,
            devices,
            backend,
            settings,
        }
    }

    pub fn devices(&self) -> &NbdDevicePool {
        &self.devices
    }

    /// Mount one completed backup disk read-only. Steps roll back in
    /// reverse on failure.
    pub async fn mount_backup(
        &self,
        backup_job_id: i64,
        disk_index: i64,
    ) -> Result<RestoreMount, RestoreError> {
        let disk = backup_queries::get_disk(&self.pool, backup_job_id, disk_index)
            .await?
            .ok_or_else(|| {
                RestoreError::NotFound(format!(
                    "backup {} has no disk {}",
                    backup_job_id, disk_index
                ))
            })?;

        if disk.status != disk_status::COMPLETED {
            return Err(RestoreError::Conflict(format!(
                "backup disk is {} rather than completed",
                disk.status
            )));
        }

        if mount_queries::get_mount_by_disk(&self.pool, disk.id).await?.is_some() {
            return Err(RestoreError::Conflict(format!(
                "backup disk {} is already mounted",
                disk.id
            )));
        }

        let device = self.devices.acquire().ok_or(RestoreError::NoCapacity)?;

        if let Err(e) = self
            .backend
            .connect_device(&device, Path::new(&disk.image_path))
            .await
        {
            self.devices.release(&device);
            return Err(e);
        }

        let filesystem = match self.backend.probe_filesystem(&device).await {
            Ok(fs) => fs,
            Err(e) => {
                let _ = self.backend.disconnect_device(&device).await;
                self.devices.release(&device);
                return Err(e);
            }
        };

        let mount_id = Uuid::new_v4().to_string();
        let mount_path = self.settings.mount_root.join(&mount_id);

        let mounted: Result<(), RestoreError> = async {
            tokio::fs::create_dir_all(&mount_path).await?;
            self.backend
                .mount_read_only(&device, &mount_path, filesystem.as_deref())
                .await
        }
        .await;

        if let Err(e) = mounted {
            let _ = tokio::fs::remove_dir(&mount_path).await;
            let _ = self.backend.disconnect_device(&device).await;
            self.devices.release(&device);
            return Err(e);
        }

        let row = match mount_queries::create_mount(
            &self.pool,
            mount_queries::NewRestoreMount {
                id: &mount_id,
                backup_disk_id: disk.id,
                mount_path: &mount_path.display().to_string(),
                nbd_device: &device,
                filesystem_type: filesystem.as_deref(),
                expires_at: Utc::now() + self.settings.ttl,
            },
        )
        .await
        {
            Ok(row) => row,
            Err(e) => {
                let _ = self.backend.unmount(&mount_path).await;
                let _ = tokio::fs::remove_dir(&mount_path).await;
                let _ = self.backend.disconnect_device(&device).await;
                self.devices.release(&device);
                return Err(e.into());
            }
        };

        mount_queries::update_mount_status(&self.pool, &row.id, mount_status::MOUNTED).await?;
        let row = self.get_mount(&row.id).await?;

        info!(
            "Mounted backup disk {} at {} via {} ({})",
            disk.id,
            mount_path.display(),
            device,
            filesystem.as_deref().unwrap_or("unknown fs")
        );
        Ok(row)
    }

    async fn get_mount(&self, mount_id: &str) -> Result<RestoreMount, RestoreError> {
        mount_queries::get_mount(&self.pool, mount_id)
            .await?
            .ok_or_else(|| RestoreError::NotFound(format!("restore mount {}", mount_id)))
    }

    /// Directory listing inside a mount. Touches last-access.
    pub async fn list_files(
        &self,
        mount_id: &str,
        relative_path: &str,
    ) -> Result<Vec<FileEntry>, RestoreError> {
        let mount = self.get_mount(mount_id).await?;
        let root = PathBuf::from(&mount.mount_path);
        let target = resolve_within(&root, relative_path)?;
        mount_queries::touch_mount(&self.pool, mount_id).await?;

        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&target).await?;
        while let Some(entry) = reader.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = target
                .join(&name)
                .strip_prefix(&root)
                .map(|p| format!("/{}", p.display()))
                .unwrap_or_else(|_| format!("/{}", name));
            entries.push(FileEntry {
                name,
                path: relative,
                is_directory: metadata.is_dir(),
                size_bytes: metadata.len() as i64,
                modified_at: metadata
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Resolve a file for download. Touches last-access.
    pub async fn file_for_download(
        &self,
        mount_id: &str,
        relative_path: &str,
    ) -> Result<PathBuf, RestoreError> {
        let mount = self.get_mount(mount_id).await?;
        let root = PathBuf::from(&mount.mount_path);
        let target = resolve_within(&root, relative_path)?;
        mount_queries::touch_mount(&self.pool, mount_id).await?;

        let metadata = tokio::fs::metadata(&target).await?;
        if !metadata.is_file() {
            return Err(RestoreError::InvalidPath(format!(
                "{} is not a regular file",
                relative_path
            )));
        }
        Ok(target)
    }

    /// Stream a directory as an archive. Last-access is touched before and
    /// after construction, so a long-running archive acts as its own
    /// heartbeat against the idle reaper.
    pub async fn archive_directory(
        &self,
        mount_id: &str,
        relative_path: &str,
        format: ArchiveFormat,
    ) -> Result<tokio::fs::File, RestoreError> {
        let mount = self.get_mount(mount_id).await?;
        let root = PathBuf::from(&mount.mount_path);
        let target = resolve_within(&root, relative_path)?;
        mount_queries::touch_mount(&self.pool, mount_id).await?;

        let metadata = tokio::fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(RestoreError::InvalidPath(format!(
                "{} is not a directory",
                relative_path
            )));
        }

        let file = build_archive(target, format).await?;
        mount_queries::touch_mount(&self.pool, mount_id).await?;
        Ok(file)
    }

    /// Full teardown: unmount, disconnect, remove directory, delete row,
    /// release the device. Idempotent: an unknown mount id succeeds.
    pub async fn unmount(&self, mount_id: &str) -> Result<(), RestoreError> {
        let mount = match mount_queries::get_mount(&self.pool, mount_id).await? {
            Some(mount) => mount,
            None => return Ok(()),
        };

        mount_queries::update_mount_status(&self.pool, mount_id, mount_status::UNMOUNTING).await?;

        let mount_path = PathBuf::from(&mount.mount_path);
        if let Err(e) = self.backend.unmount(&mount_path).await {
            warn!("Unmount of {} reported: {}", mount_path.display(), e);
        }
        if let Err(e) = self.backend.disconnect_device(&mount.nbd_device).await {
            warn!("Disconnect of {} reported: {}", mount.nbd_device, e);
        }
        if let Err(e) = tokio::fs::remove_dir(&mount_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Removing {} reported: {}", mount_path.display(), e);
            }
        }

        mount_queries::delete_mount(&self.pool, mount_id).await?;
        self.devices.release(&mount.nbd_device);

        info!("Unmounted restore mount {}", mount_id);
        Ok(())
    }

    /// Cascade helper: tear down any mount referencing a backup disk before
    /// the disk itself is deleted.
    pub async fn teardown_for_disk(&self, backup_disk_id: i64) -> Result<(), RestoreError> {
        if let Some(mount) = mount_queries::get_mount_by_disk(&self.pool, backup_disk_id).await? {
            self.unmount(&mount.id).await?;
        }
        Ok(())
    }

    pub async fn list_mounts(&self) -> Result<Vec<RestoreMount>, RestoreError> {
        Ok(mount_queries::list_mounts(&self.pool).await?)
    }

    /// One pass of the background reaper: tear down every mount past its
    /// expiry or idle timeout. Errors are logged, the sweep continues.
    pub async fn cleanup_expired(&self) -> usize {
        let mounts = match mount_queries::list_mounts(&self.pool).await {
            Ok(mounts) => mounts,
            Err(e) => {
                warn!("Mount reaper: cannot list mounts: {}", e);
                return 0;
            }
        };

        let now = Utc::now();
        let mut reaped = 0;
        for mount in mounts {
            if !mount.is_expired(now, self.settings.idle_timeout) {
                continue;
            }
            info!(
                "Reaping restore mount {} (last access {}, expires {})",
                mount.id, mount.last_accessed_at, mount.expires_at
            );
            match self.unmount(&mount.id).await {
                Ok(()) => reaped += 1,
                Err(e) => {
                    warn!("Mount reaper: teardown of {} failed: {}", mount.id, e);
                    // Leave the row visible as failed so operators can see
                    // the stuck mount; the next sweep retries it.
                    let _ = mount_queries::update_mount_status(
                        &self.pool,
                        &mount.id,
                        mount_status::FAILED,
                    )
                    .await;
                }
            }
        }
        reaped
    }

    /// Re-adopt device leases for mounts that survived a restart. Mounts
    /// caught mid-setup by the crash are torn down instead of adopted.
    pub async fn adopt_existing_mounts(&self) -> Result<(), RestoreError> {
        for mount in mount_queries::list_mounts(&self.pool).await? {
            self.devices.adopt(&mount.nbd_device);
            if mount.status == mount_status::MOUNTING {
                warn!("Mount {} was mid-setup at shutdown; tearing it down", mount.id);
                if let Err(e) = self.unmount(&mount.id).await {
                    warn!("Teardown of half-built mount {} failed: {}", mount.id, e);
                }
            }
        }
        Ok(())
    }
}

/// Join a caller-supplied relative path onto the mount root, rejecting any
/// escape attempt before the filesystem is touched.
fn resolve_within(root: &Path, relative: &str) -> Result<PathBuf, RestoreError> {
    let candidate = Path::new(relative.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => {
                return Err(RestoreError::InvalidPath(format!(
                    "path escapes the mount root: {}",
                    relative
                )))
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_manager::manager::test_pool;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records OS-level calls instead of performing them, and fakes the
    /// mounted tree under a tempdir created by `connect_device`.
    struct FakeMountBackend {
        calls: Mutex<Vec<String>>,
        fail_mount: bool,
    }

    impl FakeMountBackend {
        fn new(fail_mount: bool) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_mount,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl MountBackend for FakeMountBackend {
        async fn connect_device(&self, device: &str, _image: &Path) -> Result<(), RestoreError> {
            self.calls.lock().push(format!("connect {}", device));
            Ok(())
        }

        async fn disconnect_device(&self, device: &str) -> Result<(), RestoreError> {
            self.calls.lock().push(format!("disconnect {}", device));
            Ok(())
        }

        async fn probe_filesystem(&self, _device: &str) -> Result<Option<String>, RestoreError> {
            Ok(Some("ntfs".to_string()))
        }

        async fn mount_read_only(
            &self,
            device: &str,
            mount_path: &Path,
            _fs: Option<&str>,
        ) -> Result<(), RestoreError> {
            if self.fail_mount {
                return Err(RestoreError::MountFailed("simulated".into()));
            }
            self.calls
                .lock()
                .push(format!("mount {} {}", device, mount_path.display()));
            Ok(())
        }

        async fn unmount(&self, mount_path: &Path) -> Result<(), RestoreError> {
            self.calls.lock().push(format!("umount {}", mount_path.display()));
            Ok(())
        }
    }

    async fn completed_disk_fixture(pool: &sqlx::Pool<Sqlite>) -> (i64, i64) {
        sqlx::query(
            "INSERT INTO repositories (name, repo_type, config, created_at)
             VALUES ('r1', 'local', '{\"root\":\"/tmp/repo\"}', ?)",
        )
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        let ctx = backup_queries::get_or_create_context(pool, "pgtest1", 1)
            .await
            .unwrap();
        let job = backup_queries::create_job(pool, ctx.id, "pgtest1", "full")
            .await
            .unwrap();
        backup_queries::create_disk(
            pool,
            backup_queries::NewBackupDisk {
                job_id: job.id,
                disk_index: 0,
                source_disk_key: "2000",
                image_path: "/tmp/repo/ctx-1/disk-0/1.qcow2",
                parent_image_path: None,
                size_bytes: 1024,
            },
        )
        .await
        .unwrap();
        backup_queries::mark_job_running(pool, job.id).await.unwrap();
        backup_queries::complete_disk(pool, job.id, 0, "cm-A0", 512)
            .await
            .unwrap();
        (job.id, 0)
    }

    fn manager_with(
        pool: sqlx::Pool<Sqlite>,
        backend: Arc<FakeMountBackend>,
        devices: u32,
        root: &Path,
    ) -> RestoreMountManager {
        RestoreMountManager::new(
            pool,
            NbdDevicePool::new(devices),
            backend,
            MountSettings {
                mount_root: root.to_path_buf(),
                ttl: Duration::hours(1),
                idle_timeout: Duration::minutes(30),
            },
        )
    }

    #[tokio::test]
    async fn mount_then_unmount_round_trips() {
        let pool = test_pool().await;
        let (job_id, disk_index) = completed_disk_fixture(&pool).await;
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeMountBackend::new(false));
        let manager = manager_with(pool.clone(), backend.clone(), 8, root.path());

        let mount = manager.mount_backup(job_id, disk_index).await.unwrap();
        assert_eq!(mount.nbd_device, "/dev/nbd0");
        assert_eq!(mount.status, mount_status::MOUNTED);
        assert_eq!(mount.filesystem_type.as_deref(), Some("ntfs"));
        assert!(mount.expires_at > Utc::now() + Duration::minutes(59));
        assert_eq!(manager.devices().in_use_count(), 1);

        // Second mount of the same disk conflicts
        let err = manager.mount_backup(job_id, disk_index).await.unwrap_err();
        assert!(matches!(err, RestoreError::Conflict(_)));

        manager.unmount(&mount.id).await.unwrap();
        assert!(manager.list_mounts().await.unwrap().is_empty());
        assert_eq!(manager.devices().in_use_count(), 0);

        // Idempotent second unmount
        manager.unmount(&mount.id).await.unwrap();

        let calls = backend.calls();
        assert!(calls.iter().any(|c| c.starts_with("connect /dev/nbd0")));
        assert!(calls.iter().any(|c| c.starts_with("umount")));
        assert!(calls.iter().any(|c| c.starts_with("disconnect /dev/nbd0")));
    }

    #[tokio::test]
    async fn failed_mount_rolls_back_device_and_rows() {
        let pool = test_pool().await;
        let (job_id, disk_index) = completed_disk_fixture(&pool).await;
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeMountBackend::new(true));
        let manager = manager_with(pool.clone(), backend.clone(), 8, root.path());

        let err = manager.mount_backup(job_id, disk_index).await.unwrap_err();
        assert!(matches!(err, RestoreError::MountFailed(_)));
        assert_eq!(manager.devices().in_use_count(), 0);
        assert!(manager.list_mounts().await.unwrap().is_empty());
        assert!(backend.calls().iter().any(|c| c.starts_with("disconnect")));
    }

    #[tokio::test]
    async fn pool_exhaustion_is_no_capacity() {
        let pool = test_pool().await;
        let (job_id, disk_index) = completed_disk_fixture(&pool).await;
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeMountBackend::new(false));
        let manager = manager_with(pool.clone(), backend, 0, root.path());

        let err = manager.mount_backup(job_id, disk_index).await.unwrap_err();
        assert!(matches!(err, RestoreError::NoCapacity));
    }

    #[tokio::test]
    async fn idle_mounts_are_reaped() {
        let pool = test_pool().await;
        let (job_id, disk_index) = completed_disk_fixture(&pool).await;
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeMountBackend::new(false));
        let manager = manager_with(pool.clone(), backend, 8, root.path());

        let mount = manager.mount_backup(job_id, disk_index).await.unwrap();

        // Not expired yet
        assert_eq!(manager.cleanup_expired().await, 0);

        // Age the mount past the idle timeout
        sqlx::query("UPDATE restore_mounts SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(31))
            .bind(&mount.id)
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(manager.cleanup_expired().await, 1);
        assert!(manager.list_mounts().await.unwrap().is_empty());
        assert_eq!(manager.devices().in_use_count(), 0);
    }

    #[tokio::test]
    async fn cascade_teardown_for_disk() {
        let pool = test_pool().await;
        let (job_id, disk_index) = completed_disk_fixture(&pool).await;
        let root = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeMountBackend::new(false));
        let manager = manager_with(pool.clone(), backend, 8, root.path());

        let mount = manager.mount_backup(job_id, disk_index).await.unwrap();
        manager.teardown_for_disk(mount.backup_disk_id).await.unwrap();
        assert!(manager.list_mounts().await.unwrap().is_empty());
        assert_eq!(manager.devices().in_use_count(), 0);
    }

    #[test]
    fn path_resolution_rejects_escapes() {
        let root = Path::new("/mnt/omni-vault/restore/m-1");
        assert_eq!(
            resolve_within(root, "/Recovery/WindowsRE").unwrap(),
            root.join("Recovery/WindowsRE")
        );
        assert_eq!(resolve_within(root, "").unwrap(), root);
        assert!(resolve_within(root, "../other").is_err());
        assert!(resolve_within(root, "a/../../etc/passwd").is_err());
    }
}

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub mod archive;
pub mod device_pool;
pub mod mount_manager;

pub use device_pool::NbdDevicePool;
pub use mount_manager::RestoreMountManager;

#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No free NBD devices in the restore pool")]
    NoCapacity,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Mount operation failed: {0}")]
    MountFailed(String),

    #[error("Mount operation timed out: {0}")]
    Timeout(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Bounded wait for each OS-level mount step.
const MOUNT_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// The OS-level plumbing of a restore mount: kernel NBD attach, filesystem
/// probe, and the read-only mount itself. A trait seam so the mount manager
/// is testable without kernel devices.
#[async_trait]
pub trait MountBackend: Send + Sync {
    /// Attach an image to a kernel NBD device, read-only.
    async fn connect_device(&self, device: &str, image_path: &Path) -> Result<(), RestoreError>;

    /// Detach a kernel NBD device.
    async fn disconnect_device(&self, device: &str) -> Result<(), RestoreError>;

    /// Detect the filesystem on a device, if any.
    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>, RestoreError>;

    /// Mount the device read-only at the given path.
    async fn mount_read_only(
        &self,
        device: &str,
        mount_path: &Path,
        filesystem: Option<&str>,
    ) -> Result<(), RestoreError>;

    /// Unmount the path.
    async fn unmount(&self, mount_path: &Path) -> Result<(), RestoreError>;
}

/// Production implementation driving qemu-nbd, blkid and mount(8).
pub struct SystemMountBackend {
    qemu_nbd_binary: String,
}

impl SystemMountBackend {
    pub fn new(qemu_nbd_binary: impl Into<String>) -> Self {
        Self {
            qemu_nbd_binary: qemu_nbd_binary.into(),
        }
    }

    async fn run(&self, description: &str, command: &mut Command) -> Result<String, RestoreError> {
        let output = tokio::time::timeout(MOUNT_OP_TIMEOUT, command.output())
            .await
            .map_err(|_| RestoreError::Timeout(description.to_string()))??;

        if !output.status.success() {
            return Err(RestoreError::MountFailed(format!(
                "{}: {}",
                description,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MountBackend for SystemMountBackend {
    async fn connect_device(&self, device: &str, image_path: &Path) -> Result<(), RestoreError> {
        self.run(
            &format!("qemu-nbd connect {}", device),
            Command::new(&self.qemu_nbd_binary)
                .arg("-c")
                .arg(device)
                .arg("-r")
                .arg("-f")
                .arg("qcow2")
                .arg(image_path),
        )
        .await?;
        Ok(())
    }

    async fn disconnect_device(&self, device: &str) -> Result<(), RestoreError> {
        self.run(
            &format!("qemu-nbd disconnect {}", device),
            Command::new(&self.qemu_nbd_binary).arg("-d").arg(device),
        )
        .await?;
        Ok(())
    }

    async fn probe_filesystem(&self, device: &str) -> Result<Option<String>, RestoreError> {
        // blkid exits non-zero on "no filesystem", which is not an error here
        let output = tokio::time::timeout(
            MOUNT_OP_TIMEOUT,
            Command::new("blkid")
                .arg("-o")
                .arg("value")
                .arg("-s")
                .arg("TYPE")
                .arg(device)
                .output(),
        )
        .await
        .map_err(|_| RestoreError::Timeout(format!("blkid {}", device)))??;

        let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    async fn mount_read_only(
        &self,
        device: &str,
        mount_path: &Path,
        filesystem: Option<&str>,
    ) -> Result<(), RestoreError> {
        let mut command = Command::new("mount");
        command.arg("-o").arg("ro");
        if let Some(fs) = filesystem {
            command.arg("-t").arg(fs);
        }
        command.arg(device).arg(mount_path);
        self.run(&format!("mount {} at {}", device, mount_path.display()), &mut command)
            .await?;
        Ok(())
    }

    async fn unmount(&self, mount_path: &Path) -> Result<(), RestoreError> {
        self.run(
            &format!("umount {}", mount_path.display()),
            Command::new("umount").arg(mount_path),
        )
        .await?;
        Ok(())
    }
}

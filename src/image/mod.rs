use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

pub mod qcow2;

pub use qcow2::Qcow2Driver;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Corrupt image {path}: {detail}")]
    CorruptImage { path: String, detail: String },

    #[error("Missing backing file for {path}: {backing}")]
    MissingBackingFile { path: String, backing: String },

    #[error("Image tool failed ({command}): {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Unparseable image tool output: {0}")]
    InvalidOutput(String),

    #[error("Image operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static and backing-chain facts about one on-disk image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub path: String,
    pub format: String,
    pub logical_size: i64,
    pub physical_size: i64,
    pub backing_file: Option<String>,
}

/// Disk-image format driver.
///
/// All chain composition is delegated here so the on-disk format stays
/// pluggable. The driver refuses to create a child whose parent does not
/// pass validation.
#[async_trait]
pub trait ImageDriver: Send + Sync {
    /// Create a new copy-on-write image of the given logical size.
    async fn create_full(&self, path: &Path, size: i64) -> Result<(), ImageError>;

    /// Create an image whose backing chain points at `parent`; logical size
    /// equals the parent's.
    async fn create_incremental(&self, path: &Path, parent: &Path) -> Result<(), ImageError>;

    /// Confirm the format header is intact and the full backing chain is
    /// reachable.
    async fn validate(&self, path: &Path) -> Result<(), ImageError>;

    /// Static facts about an image, including its direct backing file.
    async fn info(&self, path: &Path) -> Result<ImageInfo, ImageError>;

    /// Logical (guest-visible) size in bytes.
    async fn logical_size(&self, path: &Path) -> Result<i64, ImageError> {
        Ok(self.info(path).await?.logical_size)
    }

    /// Physical (allocated) size in bytes.
    async fn physical_size(&self, path: &Path) -> Result<i64, ImageError> {
        Ok(self.info(path).await?.physical_size)
    }

    /// Delete the image, but only if no sibling image references it as a
    /// backing file.
    async fn delete_if_leaf(&self, path: &Path) -> Result<(), ImageError>;
}

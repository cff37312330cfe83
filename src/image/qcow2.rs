use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use super::{ImageDriver, ImageError, ImageInfo};

/// How long a single qemu-img invocation may run before it is abandoned.
const QEMU_IMG_TIMEOUT: Duration = Duration::from_secs(30);

/// qcow2 format driver backed by the qemu-img binary.
pub struct Qcow2Driver {
    binary: String,
}

/// Subset of `qemu-img info --output=json` we care about.
#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: i64,
    #[serde(rename = "actual-size", default)]
    actual_size: i64,
    format: String,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

impl Qcow2Driver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run qemu-img with a bounded wall clock and capture stdout.
    async fn run(&self, args: &[&str]) -> Result<String, ImageError> {
        let rendered = format!("{} {}", self.binary, args.join(" "));
        debug!("Running {}", rendered);

        let output = tokio::time::timeout(
            QEMU_IMG_TIMEOUT,
            Command::new(&self.binary).args(args).output(),
        )
        .await
        .map_err(|_| ImageError::Timeout(rendered.clone()))??;

        if !output.status.success() {
            return Err(ImageError::CommandFailed {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn raw_info(&self, path: &Path) -> Result<QemuImgInfo, ImageError> {
        if !path.exists() {
            return Err(ImageError::NotFound(path.display().to_string()));
        }
        let stdout = self
            .run(&["info", "--output=json", &path.display().to_string()])
            .await?;
        serde_json::from_str(&stdout).map_err(|e| ImageError::InvalidOutput(e.to_string()))
    }
}

#[async_trait]
impl ImageDriver for Qcow2Driver {
    async fn create_full(&self, path: &Path, size: i64) -> Result<(), ImageError> {
        if let Some(parent_dir) = path.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }
        self.run(&[
            "create",
            "-f",
            "qcow2",
            &path.display().to_string(),
            &size.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn create_incremental(&self, path: &Path, parent: &Path) -> Result<(), ImageError> {
        // A child against an unreadable parent would only fail at restore
        // time, so the parent is validated up front.
        self.validate(parent).await?;

        if let Some(parent_dir) = path.parent() {
            tokio::fs::create_dir_all(parent_dir).await?;
        }
        self.run(&[
            "create",
            "-f",
            "qcow2",
            "-b",
            &parent.display().to_string(),
            "-F",
            "qcow2",
            &path.display().to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn validate(&self, path: &Path) -> Result<(), ImageError> {
        let info = self.raw_info(path).await.map_err(|e| match e {
            ImageError::CommandFailed { stderr, .. } => ImageError::CorruptImage {
                path: path.display().to_string(),
                detail: stderr,
            },
            other => other,
        })?;

        if info.format != "qcow2" {
            return Err(ImageError::CorruptImage {
                path: path.display().to_string(),
                detail: format!("unexpected format {}", info.format),
            });
        }

        // Walk the backing chain by hand so the failing member is named
        // precisely instead of surfacing a generic qemu-img error.
        if let Some(backing) = info.backing_filename {
            let backing_path = resolve_backing(path, &backing);
            if !backing_path.exists() {
                return Err(ImageError::MissingBackingFile {
                    path: path.display().to_string(),
                    backing,
                });
            }
            Box::pin(self.validate(&backing_path)).await?;
        }

        match self
            .run(&["check", "-f", "qcow2", &path.display().to_string()])
            .await
        {
            Ok(_) => Ok(()),
            Err(ImageError::CommandFailed { stderr, .. }) => Err(ImageError::CorruptImage {
                path: path.display().to_string(),
                detail: stderr,
            }),
            Err(other) => Err(other),
        }
    }

    async fn info(&self, path: &Path) -> Result<ImageInfo, ImageError> {
        let raw = self.raw_info(path).await?;
        Ok(ImageInfo {
            path: path.display().to_string(),
            format: raw.format,
            logical_size: raw.virtual_size,
            physical_size: raw.actual_size,
            backing_file: raw
                .backing_filename
                .map(|b| resolve_backing(path, &b).display().to_string()),
        })
    }

    async fn delete_if_leaf(&self, path: &Path) -> Result<(), ImageError> {
        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return Err(ImageError::NotFound(path.display().to_string())),
        };

        // Every sibling image that still names us as its backing file makes
        // this image a non-leaf.
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let sibling = entry.path();
            if sibling == path || sibling.extension().map_or(true, |e| e != "qcow2") {
                continue;
            }
            match self.raw_info(&sibling).await {
                Ok(info) => {
                    if let Some(backing) = info.backing_filename {
                        if resolve_backing(&sibling, &backing) == path {
                            return Err(ImageError::CommandFailed {
                                command: "delete-if-leaf".to_string(),
                                stderr: format!(
                                    "{} is referenced by {}",
                                    path.display(),
                                    sibling.display()
                                ),
                            });
                        }
                    }
                }
                Err(e) => warn!(
                    "Skipping unreadable sibling {} during leaf check: {}",
                    sibling.display(),
                    e
                ),
            }
        }

        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}

/// Backing file entries may be relative to the referring image's directory.
fn resolve_backing(image: &Path, backing: &str) -> std::path::PathBuf {
    let backing_path = Path::new(backing);
    if backing_path.is_absolute() {
        backing_path.to_path_buf()
    } else {
        image
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(backing_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_backing_against_image_dir() {
        let image = Path::new("/repo/ctx-1/disk-0/5.qcow2");
        assert_eq!(
            resolve_backing(image, "4.qcow2"),
            Path::new("/repo/ctx-1/disk-0/4.qcow2")
        );
        assert_eq!(
            resolve_backing(image, "/repo/ctx-1/disk-0/4.qcow2"),
            Path::new("/repo/ctx-1/disk-0/4.qcow2")
        );
    }

    #[test]
    fn parses_qemu_img_info_json() {
        let raw = r#"{
            "virtual-size": 109521666048,
            "actual-size": 1248756,
            "format": "qcow2",
            "backing-filename": "3.qcow2",
            "filename": "/repo/ctx-1/disk-0/4.qcow2"
        }"#;
        let info: QemuImgInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.virtual_size, 109521666048);
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.backing_filename.as_deref(), Some("3.qcow2"));
    }
}

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::RestoreError;

/// Archive container for directory downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "targz" | "tgz" => Ok(ArchiveFormat::TarGz),
            other => Err(format!("unknown archive format: {}", other)),
        }
    }
}

/// Pack a directory into an archive written to an unlinked scratch file and
/// return the open handle. Unlinking immediately means an interrupted
/// download can never leak scratch space.
pub async fn build_archive(
    directory: PathBuf,
    format: ArchiveFormat,
) -> Result<tokio::fs::File, RestoreError> {
    let scratch = std::env::temp_dir().join(format!(
        "omni-vault-archive-{}.{}",
        uuid::Uuid::new_v4(),
        format.extension()
    ));

    let scratch_for_build = scratch.clone();
    let file = tokio::task::spawn_blocking(move || -> Result<File, RestoreError> {
        let result = match format {
            ArchiveFormat::TarGz => build_tar_gz(&directory, &scratch_for_build),
            ArchiveFormat::Zip => build_zip(&directory, &scratch_for_build),
        };
        if let Err(e) = result {
            let _ = std::fs::remove_file(&scratch_for_build);
            return Err(e);
        }

        let reopened = File::open(&scratch_for_build)?;
        std::fs::remove_file(&scratch_for_build)?;
        Ok(reopened)
    })
    .await
    .map_err(|e| RestoreError::Archive(format!("archive task failed: {}", e)))??;

    Ok(tokio::fs::File::from_std(file))
}

fn build_tar_gz(directory: &Path, scratch: &Path) -> Result<(), RestoreError> {
    let file = File::create(scratch)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", directory)
        .map_err(|e| RestoreError::Archive(e.to_string()))?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(|e| RestoreError::Archive(e.to_string()))?;
    Ok(())
}

fn build_zip(directory: &Path, scratch: &Path) -> Result<(), RestoreError> {
    use zip::write::SimpleFileOptions;

    let file = File::create(scratch)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut stack = vec![directory.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let relative = path
                .strip_prefix(directory)
                .map_err(|e| RestoreError::Archive(e.to_string()))?
                .to_string_lossy()
                .into_owned();

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                writer
                    .add_directory(format!("{}/", relative), options)
                    .map_err(|e| RestoreError::Archive(e.to_string()))?;
                stack.push(path);
            } else if file_type.is_file() {
                writer
                    .start_file(relative, options)
                    .map_err(|e| RestoreError::Archive(e.to_string()))?;
                let mut source = File::open(&path)?;
                io::copy(&mut source, &mut writer)?;
            }
            // Symlinks inside backup filesystems are skipped: following
            // them could escape the mount root.
        }
    }

    writer
        .finish()
        .map_err(|e| RestoreError::Archive(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Recovery/WindowsRE")).unwrap();
        std::fs::write(dir.path().join("Recovery/WindowsRE/winre.wim"), b"wim-data").unwrap();
        std::fs::write(dir.path().join("boot.ini"), b"[boot]").unwrap();
        dir
    }

    #[test]
    fn format_parsing() {
        assert_eq!(ArchiveFormat::from_str("zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(
            ArchiveFormat::from_str("tar.gz").unwrap(),
            ArchiveFormat::TarGz
        );
        assert!(ArchiveFormat::from_str("rar").is_err());
    }

    #[tokio::test]
    async fn tar_gz_archive_contains_the_tree() {
        let dir = fixture_dir();
        let mut file = build_archive(dir.path().to_path_buf(), ArchiveFormat::TarGz)
            .await
            .unwrap();

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.unwrap();
        assert!(!bytes.is_empty());

        // Decode and list entries to prove the tree made it in
        let decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut tar = tar::Archive::new(decoder);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.contains("winre.wim")));
        assert!(names.iter().any(|n| n.contains("boot.ini")));
    }

    #[tokio::test]
    async fn zip_archive_contains_the_tree() {
        let dir = fixture_dir();
        let mut file = build_archive(dir.path().to_path_buf(), ArchiveFormat::Zip)
            .await
            .unwrap();

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).await.unwrap();

        let reader = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(reader).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("winre.wim")));
        assert!(names.iter().any(|n| n == "boot.ini"));
    }
}

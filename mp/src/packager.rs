//! Archive packager
//!
//! Turns a finished working directory into `<name>.tar.gz` plus a
//! `<name>.tar.gz.sha256` sidecar next to it.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::domain::ProfileName;

pub const ARCHIVE_PREFIX: &str = "maxprobe-";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tar exited with {status}: {stderr}")]
    Tar { status: String, stderr: String },

    #[error("invalid working directory {0}")]
    InvalidWorkdir(PathBuf),
}

/// A finished archive as listed by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
    /// Sidecar file name, when present
    pub checksum_file: Option<String>,
}

/// Archive name for a run
pub fn archive_name(started: DateTime<Utc>, profile: ProfileName) -> String {
    format!(
        "{}{}-{}{}",
        ARCHIVE_PREFIX,
        started.format("%Y%m%dT%H%M%SZ"),
        profile,
        ARCHIVE_SUFFIX
    )
}

#[async_trait]
pub trait Packager: Send + Sync {
    /// Package `workdir` into `dest_dir/name`, returning the archive and
    /// its checksum file
    async fn package(&self, workdir: &Path, dest_dir: &Path, name: &str) -> Result<(PathBuf, PathBuf), PackageError>;
}

pub struct TarPackager;

#[async_trait]
impl Packager for TarPackager {
    async fn package(&self, workdir: &Path, dest_dir: &Path, name: &str) -> Result<(PathBuf, PathBuf), PackageError> {
        debug!(workdir = %workdir.display(), %name, "TarPackager::package: called");
        let (Some(parent), Some(dir_name)) = (workdir.parent(), workdir.file_name()) else {
            return Err(PackageError::InvalidWorkdir(workdir.to_path_buf()));
        };
        let archive = dest_dir.join(name);

        let output = tokio::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(parent)
            .arg(dir_name)
            .output()
            .await
            .map_err(|source| PackageError::Io {
                path: archive.clone(),
                source,
            })?;
        if !output.status.success() {
            let _ = fs::remove_file(&archive);
            return Err(PackageError::Tar {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let sidecar = write_checksum(&archive)?;
        Ok((archive, sidecar))
    }
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `<archive>.sha256` in `sha256sum` format
pub fn write_checksum(archive: &Path) -> Result<PathBuf, PackageError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| PackageError::Io { path, source }
    };
    let digest = sha256_file(archive).map_err(io_err(archive))?;
    let file_name = archive.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let sidecar = PathBuf::from(format!("{}.sha256", archive.display()));
    fs::write(&sidecar, format!("{}  {}\n", digest, file_name)).map_err(io_err(&sidecar))?;
    Ok(sidecar)
}

/// Archives in `dir`, newest first, at most `limit`
pub fn list_archives(dir: &Path, limit: usize) -> Vec<ArchiveInfo> {
    let pattern = dir.join(format!("{}*{}", ARCHIVE_PREFIX, ARCHIVE_SUFFIX));
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        return Vec::new();
    };

    let mut archives: Vec<ArchiveInfo> = paths
        .filter_map(|p| p.ok())
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = path.file_name()?.to_string_lossy().into_owned();
            let sidecar = format!("{}.sha256", name);
            let checksum_file = dir.join(&sidecar).is_file().then_some(sidecar);
            Some(ArchiveInfo {
                name,
                size: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                checksum_file,
                path,
            })
        })
        .collect();

    archives.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    archives.truncate(limit);
    archives
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_archive_name() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            archive_name(ts, ProfileName::Diagnostic),
            "maxprobe-20240309T070501Z-diagnostic.tar.gz"
        );
    }

    #[test]
    fn test_checksum_sidecar_format() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("maxprobe-x.tar.gz");
        fs::write(&archive, b"abc").unwrap();
        let sidecar = write_checksum(&archive).unwrap();
        let text = fs::read_to_string(sidecar).unwrap();
        assert_eq!(
            text,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  maxprobe-x.tar.gz\n"
        );
    }

    #[test]
    fn test_list_archives_filters_and_limits() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("maxprobe-a.tar.gz"), b"1").unwrap();
        fs::write(dir.path().join("maxprobe-b.tar.gz"), b"22").unwrap();
        fs::write(dir.path().join("maxprobe-b.tar.gz.sha256"), b"x").unwrap();
        fs::write(dir.path().join("other.tar.gz"), b"1").unwrap();

        let all = list_archives(dir.path(), 10);
        assert_eq!(all.len(), 2);
        let b = all.iter().find(|a| a.name == "maxprobe-b.tar.gz").unwrap();
        assert_eq!(b.size, 2);
        assert_eq!(b.checksum_file.as_deref(), Some("maxprobe-b.tar.gz.sha256"));
        assert_eq!(list_archives(dir.path(), 1).len(), 1);
    }

    #[tokio::test]
    async fn test_tar_packager_round() {
        let dir = TempDir::new().unwrap();
        let work = dir.path().join("maxprobe-run");
        fs::create_dir_all(work.join("meta")).unwrap();
        fs::write(work.join("meta/run.log"), "hello\n").unwrap();

        let (archive, sidecar) = TarPackager
            .package(&work, dir.path(), "maxprobe-test.tar.gz")
            .await
            .unwrap();
        assert!(archive.is_file());
        let text = fs::read_to_string(sidecar).unwrap();
        assert!(text.starts_with(&sha256_file(&archive).unwrap()));
    }
}

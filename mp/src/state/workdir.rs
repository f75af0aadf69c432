//! Per-run working directory

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::ProfileName;

/// Directory name for a run started at `started`
pub fn run_dir_name(started: DateTime<Utc>, profile: ProfileName) -> String {
    format!("maxprobe-{}-{}", started.format("%Y%m%dT%H%M%SZ"), profile)
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, collapsing runs,
/// and refuse the dot-only names that would escape a directory.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sub = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_sub = false;
        } else if !last_sub {
            out.push('_');
            last_sub = true;
        }
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        return "_".to_string();
    }
    out
}

/// Layout: `<root>/meta`, `<root>/analysis`, `<root>/<category>/<unit-id>`
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    /// Create the tree and prove it is writable
    pub fn create(output_dir: &Path, name: &str) -> io::Result<Self> {
        let root = output_dir.join(sanitize_name(name));
        debug!(root = %root.display(), "WorkDir::create: called");
        if root.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", root.display()),
            ));
        }
        fs::create_dir_all(root.join("meta"))?;
        fs::create_dir_all(root.join("analysis"))?;

        let probe = root.join("meta").join(".write-test");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;

        Ok(Self { root })
    }

    /// Wrap an existing directory without creating anything
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join("meta")
    }

    pub fn analysis(&self) -> PathBuf {
        self.root.join("analysis")
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Create and return the subtree owned by one unit
    pub fn unit_dir(&self, category: &str, id: &str) -> io::Result<PathBuf> {
        let dir = self.root.join(sanitize_name(category)).join(sanitize_name(id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

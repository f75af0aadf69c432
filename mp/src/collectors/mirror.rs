//! fs-mirror: bounded copy of configuration trees

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use super::{CollectContext, CollectError, Collector};
use crate::config::MirrorConfig;

pub struct FsMirror {
    config: MirrorConfig,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MirrorStats {
    copied: usize,
    skipped: usize,
    roots: usize,
}

impl FsMirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }
}

/// Destination of `src` inside the mirror: the absolute path re-rooted
fn mirrored_path(out: &Path, src: &Path) -> PathBuf {
    let rel: PathBuf = src.components().filter(|c| matches!(c, std::path::Component::Normal(_))).collect();
    out.join("tree").join(rel)
}

fn mirror_blocking(config: &MirrorConfig, out: &Path, cancel: &CancellationToken) -> Result<MirrorStats, CollectError> {
    let mut stats = MirrorStats::default();
    let mut index = String::from("path\tsize\tstatus\n");

    'roots: for root in &config.paths {
        if !root.is_dir() {
            debug!(root = %root.display(), "mirror_blocking: not a directory, skipping");
            continue;
        }
        stats.roots += 1;
        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let Ok(entry) = entry else {
                stats.skipped += 1;
                continue;
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if stats.copied >= config.max_files {
                index.push_str("-\t-\tlimit-reached\n");
                break 'roots;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let status = if size > config.max_file_bytes {
                stats.skipped += 1;
                "too-large"
            } else {
                let dst = mirrored_path(out, entry.path());
                let copied = dst
                    .parent()
                    .map(fs::create_dir_all)
                    .unwrap_or(Ok(()))
                    .and_then(|_| fs::copy(entry.path(), &dst));
                match copied {
                    Ok(_) => {
                        stats.copied += 1;
                        "copied"
                    }
                    Err(_) => {
                        stats.skipped += 1;
                        "unreadable"
                    }
                }
            };
            index.push_str(&format!("{}\t{}\t{}\n", entry.path().display(), size, status));
        }
    }

    fs::write(out.join("mirror_index.tsv"), index)?;
    Ok(stats)
}

#[async_trait]
impl Collector for FsMirror {
    fn name(&self) -> &str {
        "fs-mirror"
    }

    async fn collect(&self, ctx: CollectContext) -> Result<(), CollectError> {
        debug!(paths = ?self.config.paths, "FsMirror::collect: called");
        let config = self.config.clone();
        let out = ctx.out_dir.clone();
        let cancel = ctx.cancel.clone();
        let stats = tokio::task::spawn_blocking(move || mirror_blocking(&config, &out, &cancel))
            .await
            .map_err(|e| CollectError::Failed(format!("mirror task: {}", e)))??;

        if stats.roots == 0 {
            return Err(CollectError::Unavailable("no mirror paths exist".to_string()));
        }
        debug!(copied = stats.copied, skipped = stats.skipped, "FsMirror::collect: done");
        Ok(())
    }
}

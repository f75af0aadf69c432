//! Collector units
//!
//! An in-process collector implements [`Collector`]; external programs are
//! described by `UnitKind::External` and run by the scheduler's executor.
//! [`catalog`] assembles the unit set of a profile from the built-ins,
//! units declared in configuration and executables discovered in the
//! collectors directory.

mod httpprobe;
mod mirror;
mod netlisten;
mod sysproc;

pub use httpprobe::{HttpProbe, PROBE_TSV};
pub use mirror::FsMirror;
pub use netlisten::{LISTEN_JSON, NetListen};
pub use sysproc::SysProc;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::domain::{CollectorUnit, ProfileName, Weight};
use crate::monitor::ProcSource;

#[derive(Debug, Error)]
pub enum CollectError {
    /// The thing to probe does not exist here; recorded as skipped
    #[error("prerequisite unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// What an in-process collector gets to work with
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub unit_id: String,
    /// Directory owned by this unit
    pub out_dir: PathBuf,
    /// Root of the run's working tree, for reading other units' output
    pub run_root: PathBuf,
    /// Fires on timeout or run stop
    pub cancel: CancellationToken,
}

impl CollectContext {
    pub fn check_cancelled(&self) -> Result<(), CollectError> {
        if self.cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    /// Name used in logs and debug output
    fn name(&self) -> &str;

    async fn collect(&self, ctx: CollectContext) -> Result<(), CollectError>;
}

struct Builtin {
    id: &'static str,
    category: &'static str,
    min_profile: ProfileName,
    weight: Weight,
    prerequisites: &'static [&'static str],
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "sys-proc",
        category: "sys",
        min_profile: ProfileName::Lite,
        weight: Weight::Small,
        prerequisites: &[],
    },
    Builtin {
        id: "net-listen",
        category: "net",
        min_profile: ProfileName::Lite,
        weight: Weight::Small,
        prerequisites: &[],
    },
    Builtin {
        id: "net-http-probe",
        category: "net",
        min_profile: ProfileName::Diagnostic,
        weight: Weight::Medium,
        prerequisites: &["net-listen"],
    },
    Builtin {
        id: "fs-mirror",
        category: "fs",
        min_profile: ProfileName::Forensic,
        weight: Weight::Large,
        prerequisites: &[],
    },
];

fn builtin_collector(id: &str, config: &Config, proc: &Arc<dyn ProcSource>) -> Option<Arc<dyn Collector>> {
    let collector: Arc<dyn Collector> = match id {
        "sys-proc" => Arc::new(SysProc::new(config.monitor.proc_root.clone())),
        "net-listen" => Arc::new(NetListen::new(proc.clone())),
        "net-http-probe" => Arc::new(HttpProbe::new(config.http_probe.clone())),
        "fs-mirror" => Arc::new(FsMirror::new(config.mirror.clone())),
        _ => return None,
    };
    Some(collector)
}

/// Build the unit set of a concrete profile
pub fn catalog(config: &Config, profile: ProfileName, proc: Arc<dyn ProcSource>) -> Vec<CollectorUnit> {
    debug!(%profile, "catalog: called");
    let timeout = profile.default_timeout();
    let mut units = Vec::new();

    for b in BUILTINS.iter().filter(|b| profile.includes(b.min_profile)) {
        if let Some(collector) = builtin_collector(b.id, config, &proc) {
            units.push(
                CollectorUnit::function(b.id, b.category, collector)
                    .with_timeout(timeout)
                    .with_weight(b.weight)
                    .with_prerequisites(b.prerequisites.iter().map(|p| p.to_string()).collect()),
            );
        }
    }

    for declared in config.collectors.iter().filter(|c| c.profiles.contains(&profile)) {
        units.push(
            CollectorUnit::external(&declared.id, &declared.category, &declared.command)
                .with_args(declared.args.clone())
                .with_timeout(declared.timeout_ms.map(Duration::from_millis).unwrap_or(timeout))
                .with_weight(declared.weight)
                .with_prerequisites(declared.prerequisites.clone())
                .with_pass_workdir(declared.pass_workdir)
                .required(declared.required),
        );
    }

    if profile.includes(ProfileName::Diagnostic)
        && let Some(dir) = &config.collectors_dir
    {
        for (stem, path) in discover_executables(dir) {
            let id = format!("ext-{}", stem);
            if units.iter().any(|u| u.id == id) {
                warn!(%id, "catalog: discovered collector shadows an existing unit, ignoring");
                continue;
            }
            units.push(CollectorUnit::external(id, "ext", path.to_string_lossy()).with_timeout(timeout));
        }
    }

    units
}

/// Executable regular files in `dir`, sorted by name, as (stem, path)
pub fn discover_executables(dir: &Path) -> Vec<(String, PathBuf)> {
    use std::os::unix::fs::PermissionsExt;

    let Ok(entries) = fs::read_dir(dir) else {
        debug!(dir = %dir.display(), "discover_executables: directory not readable");
        return Vec::new();
    };
    let mut found: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            let meta = fs::metadata(&path).ok()?;
            if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
                return None;
            }
            let stem = path.file_stem()?.to_str()?.to_string();
            if stem.starts_with('.') {
                return None;
            }
            Some((crate::state::sanitize_name(&stem), path))
        })
        .collect();
    found.sort();
    found
}

/// Read at most `cap` bytes of a file
pub(crate) async fn read_capped(path: &Path, cap: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let file = tokio::fs::File::open(path).await?;
    let mut buf = Vec::new();
    file.take(cap).read_to_end(&mut buf).await?;
    Ok(buf)
}

//! Execution of a single collector unit
//!
//! Both unit kinds share one deadline policy: when the unit's timeout
//! expires or the run is stopped, the unit is signalled first and forced
//! after the grace window. Every failure mode ends in a [`UnitOutcome`];
//! nothing escapes as an error.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use secretscan::{Scanner, SensitiveLocation};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::collectors::{CollectContext, CollectError, Collector};
use crate::domain::{CollectorUnit, UnitKind, UnitStatus};

/// Terminal outcome of one unit
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub status: UnitStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output_bytes: u64,
    pub sensitive: Vec<SensitiveLocation>,
}

impl UnitOutcome {
    pub(crate) fn new(status: UnitStatus, error: Option<String>) -> Self {
        Self {
            status,
            exit_code: None,
            error,
            output_bytes: 0,
            sensitive: Vec::new(),
        }
    }

    fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }
}

/// Why a running unit was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Timeout,
    Stop,
}

impl Interrupt {
    fn outcome(self, timeout: Duration) -> UnitOutcome {
        match self {
            Interrupt::Timeout => UnitOutcome::new(
                UnitStatus::TimedOut,
                Some(format!("timed out after {}ms", timeout.as_millis())),
            ),
            Interrupt::Stop => UnitOutcome::new(UnitStatus::Failed, Some("cancelled".to_string())),
        }
    }
}

pub struct Executor {
    run_root: PathBuf,
    grace: Duration,
    scanner: Option<Arc<Scanner>>,
}

impl Executor {
    pub fn new(run_root: PathBuf, grace: Duration, scanner: Option<Arc<Scanner>>) -> Self {
        Self {
            run_root,
            grace,
            scanner,
        }
    }

    /// Run `unit` in `dir` until it finishes, times out, or `stop` fires
    pub async fn execute(&self, unit: &CollectorUnit, dir: PathBuf, stop: CancellationToken) -> UnitOutcome {
        debug!(id = %unit.id, kind = unit.kind_label(), "Executor::execute: called");
        let mut outcome = match &unit.kind {
            UnitKind::External {
                command,
                args,
                pass_workdir,
            } => self.run_external(unit, command, args, *pass_workdir, &dir, &stop).await,
            UnitKind::Function(collector) => self.run_function(unit, collector.clone(), &dir, &stop).await,
        };

        outcome.output_bytes = dir_size(&dir);
        if let Some(scanner) = &self.scanner {
            let scanner = scanner.clone();
            let root = self.run_root.clone();
            let scan_dir = dir.clone();
            let found = tokio::task::spawn_blocking(move || scanner.scan_tree_under(&root, &scan_dir)).await;
            match found {
                Ok(Ok(locations)) => outcome.sensitive = locations,
                Ok(Err(e)) => debug!(id = %unit.id, %e, "Executor::execute: scan failed"),
                Err(e) => debug!(id = %unit.id, %e, "Executor::execute: scan task failed"),
            }
        }
        debug!(id = %unit.id, status = %outcome.status, "Executor::execute: done");
        outcome
    }

    async fn run_external(
        &self,
        unit: &CollectorUnit,
        command: &str,
        args: &[String],
        pass_workdir: bool,
        dir: &Path,
        stop: &CancellationToken,
    ) -> UnitOutcome {
        let mut child = match spawn_external(command, args, pass_workdir, dir) {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return UnitOutcome::new(
                    UnitStatus::Skipped,
                    Some(format!("prerequisite unavailable: {} not found", command)),
                );
            }
            Err(e) => return UnitOutcome::new(UnitStatus::Failed, Some(format!("spawn {}: {}", command, e))),
        };
        let pid = child.id();

        let interrupt = tokio::select! {
            status = child.wait() => {
                return match status {
                    Ok(s) if s.success() => UnitOutcome::new(UnitStatus::Succeeded, None).with_exit_code(s.code()),
                    Ok(s) => {
                        let msg = match s.code() {
                            Some(code) => format!("exit status {}", code),
                            None => "terminated by signal".to_string(),
                        };
                        UnitOutcome::new(UnitStatus::Failed, Some(msg)).with_exit_code(s.code())
                    }
                    Err(e) => UnitOutcome::new(UnitStatus::Failed, Some(format!("wait: {}", e))),
                };
            }
            _ = tokio::time::sleep(unit.timeout) => Interrupt::Timeout,
            _ = stop.cancelled() => Interrupt::Stop,
        };

        debug!(id = %unit.id, ?interrupt, "Executor::run_external: terminating");
        terminate(&mut child, pid, self.grace).await;
        interrupt.outcome(unit.timeout)
    }

    async fn run_function(
        &self,
        unit: &CollectorUnit,
        collector: Arc<dyn Collector>,
        dir: &Path,
        stop: &CancellationToken,
    ) -> UnitOutcome {
        let token = stop.child_token();
        let ctx = CollectContext {
            unit_id: unit.id.clone(),
            out_dir: dir.to_path_buf(),
            run_root: self.run_root.clone(),
            cancel: token.clone(),
        };
        let mut handle = tokio::spawn(async move { collector.collect(ctx).await });

        let interrupt = tokio::select! {
            joined = &mut handle => {
                return match joined {
                    Ok(Ok(())) => UnitOutcome::new(UnitStatus::Succeeded, None),
                    Ok(Err(CollectError::Unavailable(msg))) => {
                        UnitOutcome::new(UnitStatus::Skipped, Some(format!("prerequisite unavailable: {}", msg)))
                    }
                    Ok(Err(CollectError::Cancelled)) if stop.is_cancelled() => Interrupt::Stop.outcome(unit.timeout),
                    Ok(Err(e)) => UnitOutcome::new(UnitStatus::Failed, Some(e.to_string())),
                    Err(e) => UnitOutcome::new(UnitStatus::Failed, Some(format!("collector panicked: {}", e))),
                };
            }
            _ = tokio::time::sleep(unit.timeout) => Interrupt::Timeout,
            _ = stop.cancelled() => Interrupt::Stop,
        };

        token.cancel();
        if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
            warn!(id = %unit.id, "Executor::run_function: collector ignored cancellation, aborting");
            handle.abort();
        }
        interrupt.outcome(unit.timeout)
    }
}

fn spawn_external(command: &str, args: &[String], pass_workdir: bool, dir: &Path) -> io::Result<Child> {
    let stdout = File::create(dir.join("stdout.txt"))?;
    let stderr = File::create(dir.join("stderr.txt"))?;

    let mut cmd = tokio::process::Command::new(command);
    cmd.args(args);
    if pass_workdir {
        cmd.arg(dir);
    }
    cmd.current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(true);
    cmd.spawn()
}

/// SIGTERM the unit's process group, then SIGKILL after `grace`
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let group = Pid::from_raw(pid as i32);
    debug!(pid, "terminate: sending SIGTERM");
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(pid, %e, "terminate: SIGTERM failed");
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        debug!(pid, "terminate: exited within grace");
        return;
    }
    warn!(pid, "terminate: unit did not exit within grace, sending SIGKILL");
    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill().await;
}

/// Total size of regular files under `dir`
pub fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

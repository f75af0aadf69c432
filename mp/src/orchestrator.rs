//! Run orchestration: start, stop and finalize runs
//!
//! One `Orchestrator` owns the `StatusPublisher` and at most one active
//! run. A run moves through
//! `starting -> running [-> stopping] -> completed | failed`; the run task
//! drives the scheduler, then finalizes the working tree (secret scan,
//! report, manifest, optional redacted copy, archive) before publishing
//! the terminal phase.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use secretscan::{ScanOptions, Scanner};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collectors;
use crate::config::Config;
use crate::domain::{HardwareInfo, Profile, ProfileName, RunPhase, RunState, UnitSelection};
use crate::monitor::{ProcSource, RealProc, ResourceMonitor};
use crate::packager::{ArchiveInfo, Packager, TarPackager, archive_name};
use crate::report;
use crate::scheduler::{Executor, RunScheduler, SchedulerSettings, SchedulerStats};
use crate::state::{RunLog, StatusPublisher, WorkDir, run_dir_name};

/// Run lock in the output directory; one run per output directory at a time
pub const LOCK_FILE: &str = "maxprobe.lock";

/// Run-level failures; the run never starts
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a run is already active (phase {0})")]
    AlreadyRunning(RunPhase),

    #[error("run lock {0} is held by another process")]
    LockBusy(PathBuf),

    #[error("cannot prepare working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid profile: {0}")]
    Profile(String),
}

/// What to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub profile: ProfileName,
    pub concurrency: Option<usize>,
    pub collectors: UnitSelection,
    /// Overrides the configured output directory
    pub output_dir: Option<PathBuf>,
}

/// Returned once a run has started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHandle {
    pub run_id: String,
    pub profile: ProfileName,
    pub concurrency: usize,
    pub workdir: PathBuf,
    pub units: Vec<String>,
}

#[derive(Serialize)]
struct ProfileSelection<'a> {
    requested: ProfileName,
    selected: ProfileName,
    hardware: &'a HardwareInfo,
    concurrency: usize,
    default_timeout_ms: u128,
    max_cpu_pct: f64,
    max_mem_pct: f64,
    units: Vec<&'a str>,
}

struct ActiveRun {
    stop: CancellationToken,
}

/// Everything the run task owns
struct RunContext {
    config: Arc<Config>,
    publisher: Arc<StatusPublisher>,
    proc: Arc<dyn ProcSource>,
    packager: Arc<dyn Packager>,
    profile: Profile,
    workdir: WorkDir,
    output_dir: PathBuf,
    log: Arc<RunLog>,
    started: DateTime<Utc>,
    stop: CancellationToken,
    lock: File,
}

pub struct Orchestrator {
    config: Arc<Config>,
    publisher: Arc<StatusPublisher>,
    proc: Arc<dyn ProcSource>,
    packager: Arc<dyn Packager>,
    active: Mutex<Option<ActiveRun>>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let proc: Arc<dyn ProcSource> = Arc::new(RealProc::new(config.monitor.proc_root.clone()));
        Self::with_parts(config, proc, Arc::new(TarPackager))
    }

    pub fn with_parts(config: Config, proc: Arc<dyn ProcSource>, packager: Arc<dyn Packager>) -> Self {
        Self {
            config: Arc::new(config),
            publisher: Arc::new(StatusPublisher::new()),
            proc,
            packager,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn publisher(&self) -> Arc<StatusPublisher> {
        self.publisher.clone()
    }

    pub fn snapshot(&self) -> RunState {
        self.publisher.snapshot()
    }

    pub fn detect_hardware(&self) -> HardwareInfo {
        let cpuinfo = self.proc.read("cpuinfo").ok();
        let meminfo = self.proc.read("meminfo").ok();
        HardwareInfo::from_proc(cpuinfo.as_deref(), meminfo.as_deref())
    }

    /// Resolve a request into the profile that would run
    pub fn resolve(&self, request: &RunRequest) -> (Profile, Vec<String>) {
        let hw = self.detect_hardware();
        let name = request.profile.resolve(&hw);
        let units = collectors::catalog(&self.config, name, self.proc.clone());
        let mut profile = Profile::new(name, &hw, units);
        if let Some(n) = request.concurrency.or(self.config.scheduler.concurrency) {
            profile = profile.with_concurrency(n);
        }
        profile.select(&request.collectors)
    }

    /// Resolve the request and start a run
    pub async fn start_run(&self, request: RunRequest) -> Result<RunHandle, OrchestratorError> {
        debug!(?request, "Orchestrator::start_run: called");
        let (profile, unknown) = self.resolve(&request);
        if profile.units.is_empty() {
            return Err(OrchestratorError::Profile(format!(
                "no collector units selected for profile {}",
                profile.name
            )));
        }
        let output_dir = request.output_dir.unwrap_or_else(|| self.config.output_dir.clone());
        let handle = self.start_profile(profile, request.profile, &output_dir).await?;
        for id in unknown {
            self.publisher.push_error(format!("unknown collector {} ignored", id));
        }
        Ok(handle)
    }

    /// Start a run of an already resolved profile
    pub async fn start_profile(
        &self,
        profile: Profile,
        requested: ProfileName,
        output_dir: &Path,
    ) -> Result<RunHandle, OrchestratorError> {
        debug!(profile = %profile.name, units = profile.units.len(), "Orchestrator::start_profile: called");
        let mut active = self.active.lock().await;
        let phase = self.publisher.phase();
        if phase.is_active() {
            return Err(OrchestratorError::AlreadyRunning(phase));
        }

        let workdir_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| OrchestratorError::WorkDir { path, source }
        };
        fs::create_dir_all(output_dir).map_err(workdir_err(output_dir))?;
        let lock_path = output_dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(workdir_err(&lock_path))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(OrchestratorError::LockBusy(lock_path));
        }

        let started = Utc::now();
        let run_id = Uuid::now_v7().to_string();
        self.publisher.replace(RunState {
            run_id: Some(run_id.clone()),
            phase: RunPhase::Starting,
            profile: Some(profile.name),
            concurrency: profile.concurrency,
            total: profile.units.len(),
            started_at: Some(started),
            ..RunState::idle()
        });

        let prepared = WorkDir::create(output_dir, &run_dir_name(started, profile.name))
            .and_then(|wd| RunLog::create(&wd.meta()).map(|log| (wd, log)));
        let (workdir, log) = match prepared {
            Ok(ok) => ok,
            Err(source) => {
                let err = OrchestratorError::WorkDir {
                    path: output_dir.to_path_buf(),
                    source,
                };
                self.publisher.update(|s| {
                    s.phase = RunPhase::Failed;
                    s.ended_at = Some(Utc::now());
                    s.errors.push(err.to_string());
                });
                warn!("Run {} failed to start: {}", run_id, err);
                return Err(err);
            }
        };
        let log = Arc::new(log);
        self.publisher.update(|s| s.workdir = Some(workdir.root().to_path_buf()));

        let hw = self.detect_hardware();
        let selection = ProfileSelection {
            requested,
            selected: profile.name,
            hardware: &hw,
            concurrency: profile.concurrency,
            default_timeout_ms: profile.default_timeout.as_millis(),
            max_cpu_pct: self.config.limits.max_cpu_pct,
            max_mem_pct: self.config.limits.max_mem_pct,
            units: profile.unit_ids(),
        };
        if let Err(e) = report::write_json(&workdir.meta().join("profile_selected.json"), &selection) {
            log.warn(format!("profile_selected.json not written: {}", e));
        }

        log.info(format!(
            "run {} started: profile {}, concurrency {}, {} units, workdir {}",
            run_id,
            profile.name,
            profile.concurrency,
            profile.units.len(),
            workdir.root().display()
        ));

        let handle = RunHandle {
            run_id,
            profile: profile.name,
            concurrency: profile.concurrency,
            workdir: workdir.root().to_path_buf(),
            units: profile.unit_ids().iter().map(|s| s.to_string()).collect(),
        };

        let stop = CancellationToken::new();
        let ctx = RunContext {
            config: self.config.clone(),
            publisher: self.publisher.clone(),
            proc: self.proc.clone(),
            packager: self.packager.clone(),
            profile,
            workdir,
            output_dir: output_dir.to_path_buf(),
            log,
            started,
            stop: stop.clone(),
            lock,
        };
        if let Err(e) = self.publisher.transition(RunPhase::Running) {
            warn!("Orchestrator::start_profile: {}", e);
        }
        tokio::spawn(drive(ctx));
        *active = Some(ActiveRun { stop });
        Ok(handle)
    }

    /// Stop the active run. A no-op that reports the current phase when
    /// nothing is running or a stop is already under way.
    pub async fn stop_run(&self) -> RunPhase {
        debug!("Orchestrator::stop_run: called");
        let active = self.active.lock().await;
        let phase = self.publisher.phase();
        if phase != RunPhase::Running {
            debug!(%phase, "Orchestrator::stop_run: nothing to stop");
            return phase;
        }
        let Some(run) = active.as_ref() else {
            return phase;
        };
        if let Err(e) = self.publisher.transition(RunPhase::Stopping) {
            // Finished between the check and the transition
            debug!(%e, "Orchestrator::stop_run: run already terminal");
            return self.publisher.phase();
        }
        info!("Stopping run");
        run.stop.cancel();
        drop(active);

        let bound = self.config.scheduler.stop_wait() + self.config.scheduler.grace() + Duration::from_secs(5);
        if tokio::time::timeout(bound, self.wait_terminal()).await.is_err() {
            warn!("Run did not reach a terminal phase within {}ms", bound.as_millis());
        }
        self.publisher.phase()
    }

    /// Wait until the current run is terminal and return its final state
    pub async fn wait_terminal(&self) -> RunState {
        let mut rx = self.publisher.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            if !phase.is_active() {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.publisher.snapshot()
    }
}

fn build_scanner(config: &Config) -> Option<Arc<Scanner>> {
    if !config.scan.enabled {
        return None;
    }
    match Scanner::new(&config.scan.extra_rules) {
        Ok(scanner) => Some(Arc::new(scanner.with_options(ScanOptions {
            max_file_bytes: config.scan.max_file_bytes,
            skip_dirs: vec!["analysis".to_string(), "meta".to_string()],
        }))),
        Err(e) => {
            warn!("Secret scanning disabled: {}", e);
            None
        }
    }
}

/// The run task
async fn drive(ctx: RunContext) {
    let monitor = Arc::new(ResourceMonitor::new(ctx.proc.clone(), ctx.config.monitor.history));
    let monitor_cancel = CancellationToken::new();
    let monitor_task = monitor.clone().spawn(
        ctx.config.monitor.interval(),
        ctx.publisher.clone(),
        Some(ctx.workdir.meta()),
        monitor_cancel.clone(),
    );

    let scanner = build_scanner(&ctx.config);
    let executor = Arc::new(Executor::new(
        ctx.workdir.root().to_path_buf(),
        ctx.config.scheduler.grace(),
        scanner.clone(),
    ));
    let scheduler = RunScheduler::new(
        ctx.publisher.clone(),
        monitor,
        executor,
        ctx.workdir.clone(),
        ctx.log.clone(),
        SchedulerSettings::from_config(&ctx.config, ctx.profile.concurrency),
    );
    let stats = scheduler.execute(ctx.profile.units.clone(), ctx.stop.clone()).await;

    monitor_cancel.cancel();
    if let Err(e) = monitor_task.await {
        debug!(%e, "drive: monitor task ended abnormally");
    }
    finalize(&ctx, &stats, scanner).await;
}

async fn finalize(ctx: &RunContext, stats: &SchedulerStats, scanner: Option<Arc<Scanner>>) {
    let root = ctx.workdir.root().to_path_buf();
    let final_phase = if stats.required_failed.is_empty() {
        RunPhase::Completed
    } else {
        ctx.log
            .error(format!("required units did not succeed: {}", stats.required_failed.join(", ")));
        RunPhase::Failed
    };
    ctx.publisher.update(|s| {
        s.cancelled = stats.cancelled;
        s.ended_at = Some(Utc::now());
        if !stats.required_failed.is_empty() {
            s.errors
                .push(format!("required units did not succeed: {}", stats.required_failed.join(", ")));
        }
    });

    if let Some(scanner) = &scanner {
        let scanner = scanner.clone();
        let scan_root = root.clone();
        match tokio::task::spawn_blocking(move || scanner.scan_tree(&scan_root)).await {
            Ok(Ok(scan)) => {
                ctx.log.info(format!(
                    "secret scan: {} locations in {} files ({} skipped)",
                    scan.locations.len(),
                    scan.files_scanned,
                    scan.files_skipped
                ));
                ctx.publisher.update(|s| s.sensitive = scan.locations);
            }
            Ok(Err(e)) => record_error(ctx, format!("secret scan failed: {}", e)),
            Err(e) => record_error(ctx, format!("secret scan task failed: {}", e)),
        }
    }

    let mut final_state = ctx.publisher.snapshot();
    final_state.phase = final_phase;
    let artifacts_root = root.clone();
    match tokio::task::spawn_blocking(move || report::write_artifacts(&final_state, &artifacts_root)).await {
        Ok(Ok(())) => ctx.log.info("report written to analysis/REPORT.md"),
        Ok(Err(e)) => record_error(ctx, format!("report failed: {:#}", e)),
        Err(e) => record_error(ctx, format!("report task failed: {}", e)),
    }

    if let Some(scanner) = scanner.filter(|_| ctx.config.scan.redacted_copy) {
        let src = root.clone();
        let dst = ctx.output_dir.join(format!("{}-redacted", ctx.workdir.name()));
        let target = dst.clone();
        match tokio::task::spawn_blocking(move || scanner.redact_tree(&src, &target)).await {
            Ok(Ok(summary)) => ctx.log.info(format!(
                "redacted copy at {}: {} files, {} redacted lines",
                dst.display(),
                summary.files_copied,
                summary.lines_redacted
            )),
            Ok(Err(e)) => record_error(ctx, format!("redacted copy failed: {}", e)),
            Err(e) => record_error(ctx, format!("redacted copy task failed: {}", e)),
        }
    }

    if ctx.config.package.enabled {
        let name = archive_name(ctx.started, ctx.profile.name);
        ctx.log.info(format!("packaging {}", name));
        match ctx.packager.package(&root, &ctx.output_dir, &name).await {
            Ok((archive, checksum)) => {
                let info = fs::metadata(&archive).map(|meta| ArchiveInfo {
                    name: name.clone(),
                    path: archive.clone(),
                    size: meta.len(),
                    modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                    checksum_file: checksum.file_name().map(|n| n.to_string_lossy().into_owned()),
                });
                match info {
                    Ok(info) => {
                        ctx.log.info(format!("archive {} ({} bytes)", archive.display(), info.size));
                        ctx.publisher.update(|s| s.archive = Some(info));
                    }
                    Err(e) => record_error(ctx, format!("archive {} unreadable: {}", archive.display(), e)),
                }
            }
            Err(e) => record_error(ctx, format!("packaging failed: {}", e)),
        }
    }

    let summary = ctx.publisher.snapshot();
    ctx.log.info(format!(
        "run finished: {} ({} units, cancelled: {})",
        final_phase,
        summary.progress(),
        summary.cancelled
    ));
    // The lock is free before the terminal phase becomes visible
    if let Err(e) = FileExt::unlock(&ctx.lock) {
        debug!(%e, "finalize: run lock release failed");
    }
    if let Err(e) = ctx.publisher.transition(final_phase) {
        warn!("finalize: {}", e);
    }
}

/// Finalization errors are recorded but never fail the run
fn record_error(ctx: &RunContext, message: String) {
    ctx.log.error(&message);
    ctx.publisher.push_error(message);
}

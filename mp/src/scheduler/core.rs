//! Dispatch loop

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::executor::{Executor, UnitOutcome};
use super::graph;
use crate::config::Config;
use crate::domain::{CollectorUnit, UnitResult, UnitStatus};
use crate::monitor::{Admission, ResourceMonitor, admission, should_throttle};
use crate::state::{RunLog, StatusPublisher, WorkDir};

/// Knobs of one scheduler run
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub max_cpu_pct: f64,
    pub max_mem_pct: f64,
    pub max_throttle_wait: Duration,
    pub poll: Duration,
    /// How long a stop waits for running units before aborting them
    pub stop_wait: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config, concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            max_cpu_pct: config.limits.max_cpu_pct,
            max_mem_pct: config.limits.max_mem_pct,
            max_throttle_wait: config.scheduler.max_throttle_wait(),
            poll: config.scheduler.poll(),
            stop_wait: config.scheduler.stop_wait(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub dispatched: usize,
    pub peak_running: usize,
    /// Times admission went from allowed to paused
    pub throttle_pauses: usize,
    /// Units admitted by the starvation guard despite throttling
    pub forced_admissions: usize,
    pub cancelled: bool,
    /// Required units that did not succeed
    pub required_failed: Vec<String>,
}

pub struct RunScheduler {
    publisher: Arc<StatusPublisher>,
    monitor: Arc<ResourceMonitor>,
    executor: Arc<Executor>,
    workdir: WorkDir,
    log: Arc<RunLog>,
    settings: SchedulerSettings,
}

/// Bookkeeping of the loop
struct Dispatch {
    running: JoinSet<UnitOutcome>,
    tasks: HashMap<Id, usize>,
    terminal: HashSet<String>,
}

impl RunScheduler {
    pub fn new(
        publisher: Arc<StatusPublisher>,
        monitor: Arc<ResourceMonitor>,
        executor: Arc<Executor>,
        workdir: WorkDir,
        log: Arc<RunLog>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            publisher,
            monitor,
            executor,
            workdir,
            log,
            settings,
        }
    }

    /// Run every unit to a terminal status, or until `stop` fires
    pub async fn execute(&self, units: Vec<CollectorUnit>, stop: CancellationToken) -> SchedulerStats {
        debug!(units = units.len(), concurrency = self.settings.concurrency, "RunScheduler::execute: called");
        let plan = graph::plan(&units);
        let mut stats = SchedulerStats::default();

        // A repeated id has no slot of its own in the run state
        let (duplicates, blocked): (Vec<_>, Vec<_>) = plan
            .blocked
            .into_iter()
            .partition(|(i, _)| units[..*i].iter().any(|u| u.id == units[*i].id));
        for (idx, reason) in &duplicates {
            self.log.warn(format!("unit {} ignored: {}", units[*idx].id, reason));
            self.publisher.push_error(format!("unit {} ignored: {}", units[*idx].id, reason));
        }

        let queue_order: Vec<usize> = plan
            .order
            .iter()
            .copied()
            .chain(blocked.iter().map(|(i, _)| *i))
            .collect();
        self.publisher.update(|state| {
            state.units = queue_order.iter().map(|i| UnitResult::pending(&units[*i])).collect();
            state.total = queue_order.len();
            state.completed = 0;
            state.completion_order.clear();
        });

        let mut dispatch = Dispatch {
            running: JoinSet::new(),
            tasks: HashMap::new(),
            terminal: HashSet::new(),
        };

        for (idx, reason) in &blocked {
            self.log.warn(format!("unit {} skipped: {}", units[*idx].id, reason));
            self.settle(&units[*idx], UnitOutcome::new(UnitStatus::Skipped, Some(reason.clone())), &mut dispatch);
        }

        let mut queue: VecDeque<usize> = plan.order.into();
        let mut paused = false;
        let mut deferred_since: Option<Instant> = None;

        loop {
            if stop.is_cancelled() {
                break;
            }

            while dispatch.running.len() < self.settings.concurrency {
                let Some(pos) = queue
                    .iter()
                    .position(|i| units[*i].prerequisites.iter().all(|p| dispatch.terminal.contains(p)))
                else {
                    break;
                };
                let unit = &units[queue[pos]];

                let sample = self.monitor.current();
                let factor = unit.weight.ceiling_factor();
                let throttled = should_throttle(
                    &sample,
                    self.settings.max_cpu_pct * factor,
                    self.settings.max_mem_pct * factor,
                );
                match admission(paused, throttled) {
                    Admission::Pause if !paused => {
                        paused = true;
                        stats.throttle_pauses += 1;
                        self.log.info(format!(
                            "admission paused before {} (cpu {:.1}%, mem {:.1}%)",
                            unit.id, sample.cpu_pct, sample.mem_pct
                        ));
                    }
                    Admission::Resume => {
                        paused = false;
                        self.log.info("admission resumed");
                    }
                    _ => {}
                }

                if throttled {
                    let since = *deferred_since.get_or_insert_with(Instant::now);
                    if !dispatch.running.is_empty() || since.elapsed() < self.settings.max_throttle_wait {
                        break;
                    }
                    self.log.warn(format!(
                        "unit {} admitted after {}ms of throttling with nothing running",
                        unit.id,
                        since.elapsed().as_millis()
                    ));
                    stats.forced_admissions += 1;
                }
                deferred_since = None;

                if let Some(idx) = queue.remove(pos) {
                    self.dispatch(idx, &units, &mut dispatch, &stop);
                    stats.dispatched += 1;
                    stats.peak_running = stats.peak_running.max(dispatch.running.len());
                }
            }

            if queue.is_empty() && dispatch.running.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = dispatch.running.join_next_with_id() => {
                    self.collect(joined, &units, &mut dispatch, false);
                }
                _ = tokio::time::sleep(self.settings.poll) => {}
                _ = stop.cancelled() => {}
            }
        }

        if stop.is_cancelled() {
            stats.cancelled = true;
            self.drain(&units, &mut dispatch, queue).await;
        }

        let finished = self.publisher.snapshot();
        stats.required_failed = units
            .iter()
            .filter(|u| u.required)
            .filter(|u| finished.unit(&u.id).map(|r| r.status) != Some(UnitStatus::Succeeded))
            .map(|u| u.id.clone())
            .collect();
        debug!(?stats, "RunScheduler::execute: done");
        stats
    }

    fn dispatch(&self, idx: usize, units: &[CollectorUnit], dispatch: &mut Dispatch, stop: &CancellationToken) {
        let unit = units[idx].clone();
        let marked = self.publisher.update(|state| match state.unit_mut(&unit.id) {
            Some(r) => r.mark_running().map_err(|e| e.to_string()),
            None => Err(format!("unit {} missing from run state", unit.id)),
        });
        if let Err(e) = marked {
            warn!(id = %unit.id, %e, "RunScheduler::dispatch: could not mark running");
        }
        self.log.info(format!("unit {} started", unit.id));

        let executor = self.executor.clone();
        let workdir = self.workdir.clone();
        let stop = stop.clone();
        let handle = dispatch.running.spawn(async move {
            match workdir.unit_dir(&unit.category, &unit.id) {
                Ok(dir) => executor.execute(&unit, dir, stop).await,
                Err(e) => UnitOutcome::new(UnitStatus::Failed, Some(format!("create unit directory: {}", e))),
            }
        });
        dispatch.tasks.insert(handle.id(), idx);
    }

    fn collect(
        &self,
        joined: Result<(Id, UnitOutcome), tokio::task::JoinError>,
        units: &[CollectorUnit],
        dispatch: &mut Dispatch,
        aborted: bool,
    ) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                let message = if aborted || e.is_cancelled() {
                    "cancelled".to_string()
                } else {
                    format!("unit task panicked: {}", e)
                };
                (e.id(), UnitOutcome::new(UnitStatus::Failed, Some(message)))
            }
        };
        match dispatch.tasks.remove(&id) {
            Some(idx) => self.settle(&units[idx], outcome, dispatch),
            None => warn!(?id, "RunScheduler::collect: result for an unknown task"),
        }
    }

    /// Record a terminal outcome
    fn settle(&self, unit: &CollectorUnit, outcome: UnitOutcome, dispatch: &mut Dispatch) {
        let status = outcome.status;
        let error = outcome.error.clone();
        let recorded = self.publisher.update(|state| {
            let result = state
                .unit_mut(&unit.id)
                .ok_or_else(|| format!("unit {} missing from run state", unit.id))?;
            result.finish(outcome.status, outcome.error).map_err(|e| e.to_string())?;
            result.exit_code = outcome.exit_code;
            result.output_bytes = outcome.output_bytes;
            result.sensitive = outcome.sensitive.len();
            let duration = result.duration_ms();
            state.sensitive.extend(outcome.sensitive);
            state.record_terminal(&unit.id);
            Ok::<_, String>(duration)
        });
        dispatch.terminal.insert(unit.id.clone());

        match recorded {
            Ok(duration) => {
                let took = duration.map(|ms| format!(" in {}ms", ms)).unwrap_or_default();
                let detail = error.map(|e| format!(": {}", e)).unwrap_or_default();
                let line = format!("unit {} {}{}{}", unit.id, status, took, detail);
                match status {
                    UnitStatus::Succeeded | UnitStatus::Skipped => self.log.info(line),
                    _ => self.log.warn(line),
                }
            }
            Err(e) => warn!(id = %unit.id, %e, "RunScheduler::settle: outcome not recorded"),
        }
    }

    /// After a stop: wait for running units (bounded), abort stragglers,
    /// and skip what never started
    async fn drain(&self, units: &[CollectorUnit], dispatch: &mut Dispatch, queue: VecDeque<usize>) {
        debug!(running = dispatch.running.len(), pending = queue.len(), "RunScheduler::drain: called");
        let deadline = tokio::time::Instant::now() + self.settings.stop_wait;
        loop {
            match tokio::time::timeout_at(deadline, dispatch.running.join_next_with_id()).await {
                Ok(Some(joined)) => self.collect(joined, units, dispatch, false),
                Ok(None) => break,
                Err(_) => {
                    warn!(running = dispatch.running.len(), "RunScheduler::drain: stop wait elapsed, aborting units");
                    dispatch.running.abort_all();
                    while let Some(joined) = dispatch.running.join_next_with_id().await {
                        self.collect(joined, units, dispatch, true);
                    }
                    break;
                }
            }
        }

        for idx in queue {
            self.settle(
                &units[idx],
                UnitOutcome::new(UnitStatus::Skipped, Some("run cancelled".to_string())),
                dispatch,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ProcSource, StaticProc};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        publisher: Arc<StatusPublisher>,
        scheduler: RunScheduler,
    }

    fn settings(concurrency: usize) -> SchedulerSettings {
        SchedulerSettings {
            concurrency,
            max_cpu_pct: 85.0,
            max_mem_pct: 95.0,
            max_throttle_wait: Duration::from_millis(200),
            poll: Duration::from_millis(20),
            stop_wait: Duration::from_secs(3),
        }
    }

    fn fixture_with(source: Arc<dyn ProcSource>, settings: SchedulerSettings) -> Fixture {
        let dir = TempDir::new().unwrap();
        let workdir = WorkDir::create(dir.path(), "run").unwrap();
        let log = Arc::new(RunLog::create(&workdir.meta()).unwrap());
        let publisher = Arc::new(StatusPublisher::new());
        let monitor = Arc::new(ResourceMonitor::new(source, 10));
        monitor.sample();
        let executor = Arc::new(Executor::new(
            workdir.root().to_path_buf(),
            Duration::from_millis(300),
            None,
        ));
        let scheduler = RunScheduler::new(publisher.clone(), monitor, executor, workdir, log, settings);
        Fixture {
            _dir: dir,
            publisher,
            scheduler,
        }
    }

    fn fixture(concurrency: usize) -> Fixture {
        fixture_with(Arc::new(StaticProc::new()), settings(concurrency))
    }

    fn sh(id: &str, script: &str) -> CollectorUnit {
        CollectorUnit::external(id, "t", "sh")
            .with_args(vec!["-c".to_string(), script.to_string()])
            .with_pass_workdir(false)
            .with_timeout(Duration::from_secs(10))
    }

    fn status(publisher: &StatusPublisher, id: &str) -> UnitStatus {
        publisher.snapshot().unit(id).map(|u| u.status).unwrap()
    }

    #[tokio::test]
    async fn test_all_units_reach_terminal_state() {
        let f = fixture(2);
        let units = vec![sh("a", "true"), sh("b", "exit 1"), sh("c", "true").with_prerequisites(vec!["b".into()])];
        let stats = f.scheduler.execute(units, CancellationToken::new()).await;

        assert_eq!(stats.dispatched, 3);
        let state = f.publisher.snapshot();
        assert_eq!(state.progress(), "3/3");
        assert_eq!(status(&f.publisher, "a"), UnitStatus::Succeeded);
        assert_eq!(status(&f.publisher, "b"), UnitStatus::Failed);
        // Failed prerequisites do not block dependents
        assert_eq!(status(&f.publisher, "c"), UnitStatus::Succeeded);
        let pos = |id: &str| state.completion_order.iter().position(|x| x == id).unwrap();
        assert!(pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_never_exceeded() {
        for limit in [1, 2, 3] {
            let f = fixture(limit);
            let units: Vec<_> = (0..6).map(|i| sh(&format!("u{}", i), "sleep 0.1")).collect();
            let publisher = f.publisher.clone();
            let watcher = tokio::spawn(async move {
                let mut peak = 0;
                for _ in 0..200 {
                    peak = peak.max(publisher.snapshot().running_count());
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                peak
            });
            let stats = f.scheduler.execute(units, CancellationToken::new()).await;
            assert!(stats.peak_running <= limit);
            assert!(watcher.await.unwrap() <= limit);
        }
    }

    #[tokio::test]
    async fn test_blocked_units_are_skipped_not_dispatched() {
        let f = fixture(2);
        let units = vec![sh("a", "true").with_prerequisites(vec!["ghost".into()]), sh("b", "true")];
        let stats = f.scheduler.execute(units, CancellationToken::new()).await;
        assert_eq!(stats.dispatched, 1);
        let state = f.publisher.snapshot();
        let a = state.unit("a").unwrap();
        assert_eq!(a.status, UnitStatus::Skipped);
        assert_eq!(a.error.as_deref(), Some("unknown prerequisite ghost"));
        assert!(a.started_at.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_ignored_with_error() {
        let f = fixture(2);
        let units = vec![sh("a", "true"), sh("a", "exit 1"), sh("b", "true")];
        let stats = f.scheduler.execute(units, CancellationToken::new()).await;

        assert_eq!(stats.dispatched, 2);
        let state = f.publisher.snapshot();
        assert_eq!(state.units.len(), 2);
        assert_eq!(state.progress(), "2/2");
        assert_eq!(status(&f.publisher, "a"), UnitStatus::Succeeded);
        assert!(state.errors.iter().any(|e| e.contains("duplicate unit id a")));
    }

    #[tokio::test]
    async fn test_stop_cancels_running_and_skips_pending() {
        let f = fixture(1);
        let units = vec![sh("slow", "sleep 10"), sh("next", "true")];
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let stats = f.scheduler.execute(units, stop).await;

        assert!(stats.cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        let state = f.publisher.snapshot();
        assert_eq!(state.unit("slow").unwrap().error.as_deref(), Some("cancelled"));
        assert_eq!(state.unit("slow").unwrap().status, UnitStatus::Failed);
        assert_eq!(state.unit("next").unwrap().status, UnitStatus::Skipped);
        assert_eq!(state.unit("next").unwrap().error.as_deref(), Some("run cancelled"));
        assert_eq!(state.progress(), "2/2");
    }

    #[tokio::test]
    async fn test_required_failure_is_reported() {
        let f = fixture(1);
        let units = vec![sh("must", "exit 2").required(true), sh("may", "exit 2")];
        let stats = f.scheduler.execute(units, CancellationToken::new()).await;
        assert_eq!(stats.required_failed, vec!["must".to_string()]);
    }

    #[tokio::test]
    async fn test_throttled_admission_backs_off_then_forces() {
        let source = StaticProc::new()
            .with("stat", "cpu 100 0 0 900 0 0 0 0\n")
            .with("stat", "cpu 190 0 0 910 0 0 0 0\n")
            .with("meminfo", "MemTotal: 1000 kB\nMemAvailable: 900 kB\n");
        let mut s = settings(2);
        s.max_cpu_pct = 50.0;
        let f = fixture_with(Arc::new(source), s);

        let started = Instant::now();
        let stats = f
            .scheduler
            .execute(vec![sh("a", "true"), sh("b", "true")], CancellationToken::new())
            .await;

        assert_eq!(stats.throttle_pauses, 1);
        assert_eq!(stats.forced_admissions, 2);
        // Never more than one unit while throttled
        assert_eq!(stats.peak_running, 1);
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(status(&f.publisher, "a"), UnitStatus::Succeeded);
        assert_eq!(status(&f.publisher, "b"), UnitStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_sample_never_throttles() {
        let mut s = settings(2);
        s.max_cpu_pct = 0.0;
        s.max_mem_pct = 0.0;
        let f = fixture_with(Arc::new(StaticProc::new()), s);
        let stats = f
            .scheduler
            .execute(vec![sh("a", "true"), sh("b", "true")], CancellationToken::new())
            .await;
        assert_eq!(stats.throttle_pauses, 0);
        assert_eq!(stats.forced_admissions, 0);
    }
}

//! Resource monitor
//!
//! Samples CPU (as a delta between two reads of the cumulative counters),
//! memory and load on an interval and keeps a bounded history. The
//! scheduler only ever reads the latest sample by value.
//!
//! Sampling failures fail open: the monitor hands out an "unknown" sample
//! and `should_throttle` never throttles on it.

mod procfs;

pub use procfs::{
    CpuTimes, ListenSocket, MemInfo, ProcError, ProcSource, RealProc, StaticProc, parse_cpu_times,
    parse_listen_sockets, parse_load1, parse_meminfo,
};

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::ResourceSample;
use crate::state::StatusPublisher;

/// Admission decision handed to the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not throttled, nothing to change
    Allow,
    /// Throttled: defer new work
    Pause,
    /// Pressure cleared after a pause
    Resume,
}

/// Throttle when a known sample exceeds either ceiling. Unknown samples
/// never throttle.
pub fn should_throttle(sample: &ResourceSample, max_cpu_pct: f64, max_mem_pct: f64) -> bool {
    sample.known && (sample.cpu_pct > max_cpu_pct || sample.mem_pct > max_mem_pct)
}

pub fn admission(was_paused: bool, throttled: bool) -> Admission {
    match (was_paused, throttled) {
        (_, true) => Admission::Pause,
        (true, false) => Admission::Resume,
        (false, false) => Admission::Allow,
    }
}

struct MonitorInner {
    prev_cpu: Option<CpuTimes>,
    history: VecDeque<ResourceSample>,
}

pub struct ResourceMonitor {
    source: Arc<dyn ProcSource>,
    inner: Mutex<MonitorInner>,
    capacity: usize,
    degraded: AtomicBool,
}

impl ResourceMonitor {
    /// Create a monitor and prime the CPU counters so the first `sample`
    /// already has a baseline.
    pub fn new(source: Arc<dyn ProcSource>, capacity: usize) -> Self {
        debug!(capacity, "ResourceMonitor::new: called");
        let prev_cpu = source.read("stat").ok().and_then(|s| parse_cpu_times(&s).ok());
        Self {
            source,
            inner: Mutex::new(MonitorInner {
                prev_cpu,
                history: VecDeque::with_capacity(capacity.max(1)),
            }),
            capacity: capacity.max(1),
            degraded: AtomicBool::new(false),
        }
    }

    fn read_cpu(&self) -> Result<CpuTimes, ProcError> {
        let text = self.source.read("stat").map_err(|source| ProcError::Read {
            name: "stat".to_string(),
            source,
        })?;
        parse_cpu_times(&text)
    }

    fn read_mem(&self) -> Result<MemInfo, ProcError> {
        let text = self.source.read("meminfo").map_err(|source| ProcError::Read {
            name: "meminfo".to_string(),
            source,
        })?;
        parse_meminfo(&text)
    }

    /// Take a new sample and append it to the history
    pub fn sample(&self) -> ResourceSample {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let measured = self.read_cpu().and_then(|cpu| {
            let mem = self.read_mem()?;
            Ok((cpu, mem))
        });

        let sample = match measured {
            Ok((cpu, mem)) => {
                let prev = inner.prev_cpu.replace(cpu);
                match prev.and_then(|p| cpu.busy_pct_since(&p)) {
                    Some(cpu_pct) => {
                        let load1 = self
                            .source
                            .read("loadavg")
                            .ok()
                            .and_then(|s| parse_load1(&s).ok())
                            .unwrap_or(0.0);
                        if self.degraded.swap(false, Ordering::Relaxed) {
                            info!("Resource sampling recovered");
                        }
                        ResourceSample::new(cpu_pct, mem.used_pct(), load1)
                    }
                    // First read after priming failed, or no time elapsed
                    None => ResourceSample::unknown(),
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!("Resource sampling unavailable, admission will not be throttled: {}", e);
                }
                ResourceSample::unknown()
            }
        };

        if inner.history.len() == self.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(sample);
        sample
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.back().copied()
    }

    /// Latest sample, or the unknown sentinel before the first tick
    pub fn current(&self) -> ResourceSample {
        self.latest().unwrap_or_else(ResourceSample::unknown)
    }

    pub fn history(&self) -> Vec<ResourceSample> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().copied().collect()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Run the sampling loop until `cancel` fires. Every sample is pushed
    /// to the publisher and, when `meta_dir` is set, appended to
    /// `metrics.tsv` and written to `metrics_current.tsv`.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        publisher: Arc<StatusPublisher>,
        meta_dir: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        debug!(?interval, "ResourceMonitor::spawn: called");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("ResourceMonitor::spawn: cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let sample = self.sample();
                        publisher.set_metrics(sample);
                        if let Some(dir) = &meta_dir {
                            write_metrics(dir, &sample);
                        }
                    }
                }
            }
        })
    }
}

fn write_metrics(meta_dir: &std::path::Path, sample: &ResourceSample) {
    let line = sample.to_tsv();
    let appended = OpenOptions::new()
        .create(true)
        .append(true)
        .open(meta_dir.join("metrics.tsv"))
        .and_then(|mut f| writeln!(f, "{}", line));
    if let Err(e) = appended {
        debug!(%e, "write_metrics: failed to append metrics.tsv");
    }
    if let Err(e) = std::fs::write(meta_dir.join("metrics_current.tsv"), format!("{}\n", line)) {
        debug!(%e, "write_metrics: failed to write metrics_current.tsv");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MEM: &str = "MemTotal: 1000 kB\nMemAvailable: 400 kB\n";

    fn source() -> StaticProc {
        StaticProc::new()
            .with("stat", "cpu 100 0 0 900 0 0 0 0\n")
            .with("stat", "cpu 180 0 0 920 0 0 0 0\n")
            .with("meminfo", MEM)
            .with("loadavg", "1.50 1.00 0.50 1/50 99\n")
    }

    #[test]
    fn test_sample_uses_delta() {
        let monitor = ResourceMonitor::new(Arc::new(source()), 10);
        let s = monitor.sample();
        assert!(s.known);
        assert_eq!(s.cpu_pct, 80.0);
        assert_eq!(s.mem_pct, 60.0);
        assert_eq!(s.load1, 1.5);
    }

    #[test]
    fn test_throttle_zero_ceiling() {
        let monitor = ResourceMonitor::new(Arc::new(source()), 10);
        let s = monitor.sample();
        assert!(s.cpu_pct > 0.0);
        assert!(should_throttle(&s, 0.0, 100.0));
        assert!(!should_throttle(&s, 100.0, 100.0));
    }

    #[test]
    fn test_unavailable_source_fails_open() {
        let monitor = ResourceMonitor::new(Arc::new(StaticProc::new()), 10);
        let s = monitor.sample();
        assert!(!s.known);
        assert!(monitor.is_degraded());
        assert!(!should_throttle(&s, 0.0, 0.0));
    }

    #[test]
    fn test_history_is_bounded() {
        let src = StaticProc::new().with("meminfo", MEM);
        for i in 0..20u64 {
            src.push("stat", &format!("cpu {} 0 0 {} 0 0 0 0\n", 100 + i * 10, 900 + i * 10));
        }
        let monitor = ResourceMonitor::new(Arc::new(src), 5);
        for _ in 0..12 {
            monitor.sample();
        }
        let history = monitor.history();
        assert_eq!(history.len(), 5);
        assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(monitor.latest(), history.last().copied());
    }

    #[test]
    fn test_admission_transitions() {
        assert_eq!(admission(false, false), Admission::Allow);
        assert_eq!(admission(false, true), Admission::Pause);
        assert_eq!(admission(true, true), Admission::Pause);
        assert_eq!(admission(true, false), Admission::Resume);
    }

    #[tokio::test]
    async fn test_spawn_writes_metrics_files() {
        let dir = TempDir::new().unwrap();
        let monitor = Arc::new(ResourceMonitor::new(Arc::new(source()), 10));
        let publisher = Arc::new(StatusPublisher::new());
        let cancel = CancellationToken::new();

        let handle = monitor.clone().spawn(
            Duration::from_millis(10),
            publisher.clone(),
            Some(dir.path().to_path_buf()),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        handle.await.unwrap();

        let all = std::fs::read_to_string(dir.path().join("metrics.tsv")).unwrap();
        assert!(all.lines().count() >= 2);
        let current = std::fs::read_to_string(dir.path().join("metrics_current.tsv")).unwrap();
        assert_eq!(current.lines().count(), 1);
        assert!(publisher.snapshot().metrics.is_some());
    }
}

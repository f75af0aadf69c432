//! Integration tests for maxprobe
//!
//! These tests drive whole runs through the public `Orchestrator` API with
//! small shell commands as collector units.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use maxprobe::config::{Config, ExternalUnitConfig};
use maxprobe::domain::{ProfileName, RunPhase, UnitSelection, UnitStatus, Weight};
use maxprobe::monitor::StaticProc;
use maxprobe::orchestrator::{Orchestrator, OrchestratorError, RunRequest};
use maxprobe::packager::TarPackager;
use tempfile::TempDir;

fn shell_unit(id: &str, script: &str, timeout_ms: u64) -> ExternalUnitConfig {
    ExternalUnitConfig {
        id: id.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        category: "t".to_string(),
        timeout_ms: Some(timeout_ms),
        weight: Weight::Small,
        prerequisites: Vec::new(),
        profiles: vec![ProfileName::Lite],
        required: false,
        pass_workdir: false,
    }
}

fn config(dir: &Path, units: Vec<ExternalUnitConfig>) -> Config {
    let mut config = Config::default();
    config.output_dir = dir.to_path_buf();
    config.limits.max_cpu_pct = 100.0;
    config.limits.max_mem_pct = 100.0;
    config.monitor.interval_ms = 50;
    config.monitor.proc_root = dir.join("no-proc");
    config.scheduler.grace_ms = 200;
    config.scheduler.poll_ms = 20;
    config.scheduler.stop_wait_ms = 1000;
    config.package.enabled = false;
    config.collectors = units;
    config
}

fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::with_parts(config, Arc::new(StaticProc::new()), Arc::new(TarPackager))
}

fn request(ids: &[&str], concurrency: usize) -> RunRequest {
    RunRequest {
        profile: ProfileName::Lite,
        concurrency: Some(concurrency),
        collectors: UnitSelection::Only(ids.iter().map(|s| s.to_string()).collect()),
        output_dir: None,
    }
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[tokio::test]
async fn test_timeout_does_not_block_dependent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut c = shell_unit("c", "echo after-a", 5000);
    c.prerequisites = vec!["a".to_string()];
    let units = vec![shell_unit("a", "sleep 5", 1000), shell_unit("b", "true", 5000), c];
    let orch = orchestrator(config(dir.path(), units));

    let handle = orch.start_run(request(&["a", "b", "c"], 2)).await.expect("run should start");
    assert_eq!(handle.concurrency, 2);
    assert_eq!(handle.units.len(), 3);

    let state = tokio::time::timeout(Duration::from_secs(10), orch.wait_terminal())
        .await
        .expect("run should finish");

    assert_eq!(state.phase, RunPhase::Completed);
    assert!(!state.cancelled);
    assert_eq!(state.progress(), "3/3");

    let a = state.unit("a").unwrap();
    let b = state.unit("b").unwrap();
    let c = state.unit("c").unwrap();
    assert_eq!(a.status, UnitStatus::TimedOut);
    assert_eq!(b.status, UnitStatus::Succeeded);
    assert_eq!(c.status, UnitStatus::Succeeded);
    assert!(a.error.as_deref().unwrap().contains("timed out"));

    // c waits for a to be terminal; b never waits for anything
    assert!(c.started_at.unwrap() >= a.ended_at.unwrap());
    assert!(b.started_at.unwrap() < a.ended_at.unwrap());
    assert_eq!(state.completion_order, vec!["b", "a", "c"]);

    let workdir = state.workdir.clone().unwrap();
    let out = std::fs::read_to_string(workdir.join("t/c/stdout.txt")).unwrap();
    assert_eq!(out.trim(), "after-a");
    assert!(workdir.join("analysis/REPORT.md").is_file());
    assert!(workdir.join("meta/manifest.json").is_file());
}

// =============================================================================
// Scheduling bounds
// =============================================================================

#[tokio::test]
async fn test_running_never_exceeds_concurrency() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let units: Vec<_> = (0..6)
        .map(|i| shell_unit(&format!("u{}", i), "sleep 0.3", 5000))
        .collect();
    let orch = orchestrator(config(dir.path(), units));
    let ids: Vec<String> = (0..6).map(|i| format!("u{}", i)).collect();
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    orch.start_run(request(&ids, 2)).await.expect("run should start");

    let mut peak = 0;
    loop {
        let snapshot = orch.snapshot();
        peak = peak.max(snapshot.running_count());
        if !snapshot.phase.is_active() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let state = orch.wait_terminal().await;
    assert!(peak <= 2, "peak running {} exceeds limit", peak);
    assert!(peak >= 1);
    assert_eq!(state.count(UnitStatus::Succeeded), 6);
}

#[tokio::test]
async fn test_missing_binary_is_skipped() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut unit = shell_unit("ghost", "", 5000);
    unit.command = "/nonexistent/maxprobe-collector".to_string();
    unit.args = Vec::new();
    let orch = orchestrator(config(dir.path(), vec![unit]));

    orch.start_run(request(&["ghost"], 1)).await.expect("run should start");
    let state = orch.wait_terminal().await;

    assert_eq!(state.phase, RunPhase::Completed);
    let ghost = state.unit("ghost").unwrap();
    assert_eq!(ghost.status, UnitStatus::Skipped);
    assert!(ghost.error.as_deref().unwrap().starts_with("prerequisite unavailable"));
}

// =============================================================================
// Run lifecycle
// =============================================================================

#[tokio::test]
async fn test_second_start_rejected_then_stop() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let units = vec![shell_unit("slow", "sleep 10", 20_000), shell_unit("later", "true", 5000)];
    let orch = orchestrator(config(dir.path(), units));

    orch.start_run(request(&["slow", "later"], 1)).await.expect("run should start");
    match orch.start_run(request(&["slow"], 1)).await {
        Err(OrchestratorError::AlreadyRunning(phase)) => assert!(phase.is_active()),
        other => panic!("expected AlreadyRunning, got {:?}", other.map(|h| h.run_id)),
    }

    assert_eq!(orch.stop_run().await, RunPhase::Completed);
    assert_eq!(orch.stop_run().await, RunPhase::Completed);

    let state = orch.snapshot();
    assert!(state.cancelled);
    let slow = state.unit("slow").unwrap();
    assert_eq!(slow.status, UnitStatus::Failed);
    assert_eq!(slow.error.as_deref(), Some("cancelled"));
    let later = state.unit("later").unwrap();
    assert_eq!(later.status, UnitStatus::Skipped);
    assert_eq!(later.error.as_deref(), Some("run cancelled"));
}

#[tokio::test]
async fn test_new_run_after_completion() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let orch = orchestrator(config(dir.path(), vec![shell_unit("quick", "true", 5000)]));

    let first = orch.start_run(request(&["quick"], 1)).await.expect("first run");
    orch.wait_terminal().await;
    // Working directory names have one-second resolution
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let second = orch.start_run(request(&["quick"], 1)).await.expect("second run");
    let state = orch.wait_terminal().await;

    assert_ne!(first.run_id, second.run_id);
    assert_ne!(first.workdir, second.workdir);
    assert_eq!(state.run_id.as_deref(), Some(second.run_id.as_str()));
    assert_eq!(state.phase, RunPhase::Completed);
}

#[tokio::test]
async fn test_required_unit_failure_fails_run() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut must = shell_unit("must", "exit 4", 5000);
    must.required = true;
    let orch = orchestrator(config(dir.path(), vec![must, shell_unit("other", "true", 5000)]));

    orch.start_run(request(&["must", "other"], 2)).await.expect("run should start");
    let state = orch.wait_terminal().await;

    assert_eq!(state.phase, RunPhase::Failed);
    let must = state.unit("must").unwrap();
    assert_eq!(must.status, UnitStatus::Failed);
    assert_eq!(must.exit_code, Some(4));
    assert_eq!(state.unit("other").unwrap().status, UnitStatus::Succeeded);
    assert!(state.errors.iter().any(|e| e.contains("must")));
}

#[tokio::test]
async fn test_held_run_lock_rejects_start() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.path().join("maxprobe.lock"))
        .unwrap();
    lock.try_lock_exclusive().unwrap();

    let orch = orchestrator(config(dir.path(), vec![shell_unit("quick", "true", 5000)]));
    let result = orch.start_run(request(&["quick"], 1)).await;
    assert!(matches!(result, Err(OrchestratorError::LockBusy(_))));
    assert_eq!(orch.snapshot().phase, RunPhase::Idle);
}

#[tokio::test]
async fn test_unknown_collector_reported() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let orch = orchestrator(config(dir.path(), vec![shell_unit("quick", "true", 5000)]));

    orch.start_run(request(&["quick", "nope"], 1)).await.expect("run should start");
    let state = orch.wait_terminal().await;

    assert_eq!(state.total, 1);
    assert!(state.errors.iter().any(|e| e == "unknown collector nope ignored"));
}

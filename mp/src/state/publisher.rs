//! StatusPublisher - consistent snapshots of the run record
//!
//! Writers apply a whole mutation under one write lock; readers clone the
//! record under a read lock, so nobody observes a half-applied update and
//! a reader holds the lock only for the time of the copy. Phase
//! notifications go out under the write lock, so they arrive in update
//! order. File mirrors are written after it is released, in the same order.

use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, RwLock};

use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{ResourceSample, RunPhase, RunState};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid run phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: RunPhase,
    pub to: RunPhase,
}

pub struct StatusPublisher {
    state: RwLock<RunState>,
    phase_tx: watch::Sender<RunPhase>,
    /// Last (phase, progress) written to meta/, to skip redundant writes
    mirrored: Mutex<Option<(RunPhase, String)>>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(RunPhase::Idle);
        Self {
            state: RwLock::new(RunState::idle()),
            phase_tx,
            mirrored: Mutex::new(None),
        }
    }

    /// A full copy of the current record
    pub fn snapshot(&self) -> RunState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn phase(&self) -> RunPhase {
        self.state.read().unwrap_or_else(|e| e.into_inner()).phase
    }

    /// Phase change notifications
    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    /// Apply `f` atomically and publish the result
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut state);
        let phase = state.phase;
        self.phase_tx.send_if_modified(|current| {
            if *current != phase {
                *current = phase;
                true
            } else {
                false
            }
        });

        // Lock order is state then mirrored
        let mirrored = self.mirrored.lock().unwrap_or_else(|e| e.into_inner());
        let progress = state.progress();
        let workdir = state.workdir.clone();
        drop(state);
        Self::mirror(mirrored, phase, progress, workdir);
        out
    }

    /// Replace the whole record, used when a new run begins
    pub fn replace(&self, next: RunState) {
        debug!(phase = %next.phase, "StatusPublisher::replace: called");
        *self.mirrored.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.update(|state| *state = next);
    }

    /// Validated phase change; returns the previous phase
    pub fn transition(&self, to: RunPhase) -> Result<RunPhase, PhaseError> {
        self.update(|state| {
            let from = state.phase;
            if !from.can_transition_to(to) {
                return Err(PhaseError { from, to });
            }
            state.phase = to;
            debug!(%from, %to, "StatusPublisher::transition: applied");
            Ok(from)
        })
    }

    pub fn set_metrics(&self, sample: ResourceSample) {
        self.update(|state| state.metrics = Some(sample));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|state| state.errors.push(message));
    }

    fn mirror(
        mut mirrored: MutexGuard<'_, Option<(RunPhase, String)>>,
        phase: RunPhase,
        progress: String,
        workdir: Option<PathBuf>,
    ) {
        let Some(root) = workdir else {
            return;
        };
        if mirrored.as_ref() == Some(&(phase, progress.clone())) {
            return;
        }
        let meta = root.join("meta");
        if meta.is_dir() {
            let written = fs::write(meta.join("phase.txt"), format!("{}\n", phase))
                .and_then(|_| fs::write(meta.join("progress.txt"), format!("{}\n", progress)));
            if let Err(e) = written {
                debug!(%e, "StatusPublisher::mirror: failed to mirror status files");
            }
        }
        *mirrored = Some((phase, progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_starts_idle() {
        let p = StatusPublisher::new();
        assert_eq!(p.phase(), RunPhase::Idle);
        assert_eq!(p.snapshot().progress(), "0/0");
    }

    #[test]
    fn test_transition_validation() {
        let p = StatusPublisher::new();
        assert_eq!(p.transition(RunPhase::Starting), Ok(RunPhase::Idle));
        assert_eq!(p.transition(RunPhase::Running), Ok(RunPhase::Starting));
        let err = p.transition(RunPhase::Starting).unwrap_err();
        assert_eq!(err.from, RunPhase::Running);
        assert_eq!(p.phase(), RunPhase::Running);
    }

    #[tokio::test]
    async fn test_subscribe_sees_phase_changes() {
        let p = StatusPublisher::new();
        let mut rx = p.subscribe();
        p.transition(RunPhase::Starting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), RunPhase::Starting);
    }

    #[test]
    fn test_mirror_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("meta")).unwrap();
        let p = StatusPublisher::new();
        p.update(|s| {
            s.workdir = Some(dir.path().to_path_buf());
            s.total = 4;
            s.phase = RunPhase::Running;
        });
        let phase = std::fs::read_to_string(dir.path().join("meta/phase.txt")).unwrap();
        let progress = std::fs::read_to_string(dir.path().join("meta/progress.txt")).unwrap();
        assert_eq!(phase.trim(), "running");
        assert_eq!(progress.trim(), "0/4");
    }

    #[test]
    fn test_concurrent_updates_publish_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("meta")).unwrap();
        let p = Arc::new(StatusPublisher::new());
        p.update(|s| s.workdir = Some(dir.path().to_path_buf()));
        let rx = p.subscribe();

        let phases = [RunPhase::Running, RunPhase::Completed, RunPhase::Failed, RunPhase::Starting];
        let writers: Vec<_> = phases
            .into_iter()
            .map(|phase| {
                let p = p.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        p.update(|s| {
                            s.phase = phase;
                            s.total = i;
                        });
                        p.push_error("noise");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let last = p.phase();
        assert_eq!(*rx.borrow(), last);
        let mirrored = std::fs::read_to_string(dir.path().join("meta/phase.txt")).unwrap();
        assert_eq!(mirrored.trim(), last.to_string());
    }

    #[test]
    fn test_readers_never_see_partial_updates() {
        let p = Arc::new(StatusPublisher::new());
        let writer = {
            let p = p.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    p.update(|s| {
                        s.total = i;
                        s.completed = i;
                    });
                }
            })
        };
        for _ in 0..500 {
            let snap = p.snapshot();
            assert_eq!(snap.total, snap.completed);
        }
        writer.join().unwrap();
    }
}

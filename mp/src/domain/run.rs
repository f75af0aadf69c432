//! RunState - the single record of a run

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use secretscan::SensitiveLocation;
use serde::{Deserialize, Serialize};

use super::profile::ProfileName;
use super::sample::ResourceSample;
use super::unit::{UnitResult, UnitStatus};
use crate::packager::ArchiveInfo;

/// Run lifecycle: idle -> starting -> running -> stopping -> completed | failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    /// A run owns the working tree in these phases
    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Starting | RunPhase::Running | RunPhase::Stopping)
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle | Completed | Failed, Starting)
                | (Starting, Running | Stopping | Failed)
                | (Running, Stopping | Completed | Failed)
                | (Stopping, Completed | Failed)
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Starting => "starting",
            RunPhase::Running => "running",
            RunPhase::Stopping => "stopping",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Everything the status consumer can see about a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Option<String>,
    pub phase: RunPhase,
    pub profile: Option<ProfileName>,
    pub concurrency: usize,

    /// Every unit of the run, in queue order
    pub units: Vec<UnitResult>,

    /// Unit ids in the order they reached a terminal status
    pub completion_order: Vec<String>,

    pub metrics: Option<ResourceSample>,
    pub completed: usize,
    pub total: usize,
    pub workdir: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Set when the run was stopped before its queue drained
    pub cancelled: bool,
    pub errors: Vec<String>,
    pub sensitive: Vec<SensitiveLocation>,
    pub archive: Option<ArchiveInfo>,
}

impl RunState {
    pub fn idle() -> Self {
        Self::default()
    }

    /// `completed/total`
    pub fn progress(&self) -> String {
        format!("{}/{}", self.completed, self.total)
    }

    pub fn unit(&self, id: &str) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn unit_mut(&mut self, id: &str) -> Option<&mut UnitResult> {
        self.units.iter_mut().find(|u| u.id == id)
    }

    pub fn running_count(&self) -> usize {
        self.units.iter().filter(|u| u.status == UnitStatus::Running).count()
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    /// Record that a unit reached a terminal status
    pub fn record_terminal(&mut self, id: &str) {
        self.completion_order.push(id.to_string());
        self.completed = self.completion_order.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(RunPhase::Idle.can_transition_to(RunPhase::Starting));
        assert!(RunPhase::Completed.can_transition_to(RunPhase::Starting));
        assert!(RunPhase::Running.can_transition_to(RunPhase::Stopping));
        assert!(RunPhase::Stopping.can_transition_to(RunPhase::Completed));
        assert!(!RunPhase::Stopping.can_transition_to(RunPhase::Stopping));
        assert!(!RunPhase::Completed.can_transition_to(RunPhase::Completed));
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Running));
    }

    #[test]
    fn test_phase_classes() {
        assert!(RunPhase::Failed.is_terminal());
        assert!(!RunPhase::Idle.is_terminal());
        assert!(RunPhase::Stopping.is_active());
        assert!(!RunPhase::Idle.is_active());
    }

    #[test]
    fn test_progress_string() {
        let mut state = RunState::idle();
        state.total = 3;
        state.record_terminal("a");
        assert_eq!(state.progress(), "1/3");
        assert_eq!(serde_json::to_value(state.phase).unwrap(), "idle");
    }
}

//! Collector unit and its result

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collectors::Collector;

/// Relative resource cost of a unit; heavier units are admitted against
/// lower ceilings so they start only when there is headroom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weight {
    #[default]
    Small,
    Medium,
    Large,
}

impl Weight {
    /// Multiplier applied to the configured CPU/memory ceilings
    pub fn ceiling_factor(&self) -> f64 {
        match self {
            Weight::Small => 1.0,
            Weight::Medium => 0.9,
            Weight::Large => 0.75,
        }
    }
}

impl fmt::Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weight::Small => write!(f, "small"),
            Weight::Medium => write!(f, "medium"),
            Weight::Large => write!(f, "large"),
        }
    }
}

/// How a unit executes
#[derive(Clone)]
pub enum UnitKind {
    /// In-process collector invoked with a cancellation token
    Function(Arc<dyn Collector>),

    /// External program, invoked as `<command> [args..] <unit-dir>`
    External {
        command: String,
        args: Vec<String>,
        pass_workdir: bool,
    },
}

impl fmt::Debug for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Function(c) => f.debug_tuple("Function").field(&c.name()).finish(),
            UnitKind::External {
                command,
                args,
                pass_workdir,
            } => f
                .debug_struct("External")
                .field("command", command)
                .field("args", args)
                .field("pass_workdir", pass_workdir)
                .finish(),
        }
    }
}

/// One independently schedulable probe
#[derive(Debug, Clone)]
pub struct CollectorUnit {
    pub id: String,
    /// Top-level subtree of the working directory the unit writes under
    pub category: String,
    pub kind: UnitKind,
    pub timeout: Duration,
    pub weight: Weight,
    pub prerequisites: Vec<String>,
    /// A required unit that does not succeed fails the run
    pub required: bool,
}

impl CollectorUnit {
    pub fn function(id: impl Into<String>, category: impl Into<String>, collector: Arc<dyn Collector>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            kind: UnitKind::Function(collector),
            timeout: Duration::from_secs(60),
            weight: Weight::Small,
            prerequisites: Vec::new(),
            required: false,
        }
    }

    pub fn external(id: impl Into<String>, category: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            kind: UnitKind::External {
                command: command.into(),
                args: Vec::new(),
                pass_workdir: true,
            },
            timeout: Duration::from_secs(60),
            weight: Weight::Small,
            prerequisites: Vec::new(),
            required: false,
        }
    }

    pub fn with_args(mut self, new_args: Vec<String>) -> Self {
        if let UnitKind::External { args, .. } = &mut self.kind {
            *args = new_args;
        }
        self
    }

    pub fn with_pass_workdir(mut self, pass: bool) -> Self {
        if let UnitKind::External { pass_workdir, .. } = &mut self.kind {
            *pass_workdir = pass;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_weight(mut self, weight: Weight) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<String>) -> Self {
        self.prerequisites = prerequisites;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn kind_label(&self) -> &'static str {
        match self.kind {
            UnitKind::Function(_) => "function",
            UnitKind::External { .. } => "external",
        }
    }
}

/// Unit lifecycle: pending -> running -> one terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Skipped | UnitStatus::TimedOut
        )
    }

    /// Allowed moves. Skipped may be reached directly from pending (never
    /// dispatched) or from running (executable turned out to be missing).
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        match self {
            UnitStatus::Pending => matches!(next, UnitStatus::Running | UnitStatus::Skipped),
            UnitStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running => "running",
            UnitStatus::Succeeded => "succeeded",
            UnitStatus::Failed => "failed",
            UnitStatus::Skipped => "skipped",
            UnitStatus::TimedOut => "timed-out",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unit {id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub id: String,
    pub from: UnitStatus,
    pub to: UnitStatus,
}

/// Outcome record for one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitResult {
    pub id: String,
    pub category: String,
    pub kind: String,
    pub weight: Weight,
    pub status: UnitStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output_bytes: u64,
    pub error: Option<String>,
    /// Sensitive locations found in this unit's output
    pub sensitive: usize,
}

impl UnitResult {
    pub fn pending(unit: &CollectorUnit) -> Self {
        Self {
            id: unit.id.clone(),
            category: unit.category.clone(),
            kind: unit.kind_label().to_string(),
            weight: unit.weight,
            status: UnitStatus::Pending,
            exit_code: None,
            started_at: None,
            ended_at: None,
            output_bytes: 0,
            error: None,
            sensitive: 0,
        }
    }

    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(UnitStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Move to a terminal status and stamp the end time
    pub fn finish(&mut self, status: UnitStatus, error: Option<String>) -> Result<(), TransitionError> {
        self.transition(status)?;
        self.ended_at = Some(Utc::now());
        self.error = error;
        Ok(())
    }

    fn transition(&mut self, to: UnitStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

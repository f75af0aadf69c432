//! maxprobe - diagnostic snapshot collector
//!
//! Runs a profile of collector units against the local host with a
//! concurrency limit, dependency ordering, per-unit deadlines and
//! resource-aware admission, then scans, reports and packages the result.
//!
//! # Modules
//!
//! - [`domain`] - profiles, collector units, run state, resource samples
//! - [`monitor`] - CPU/memory sampling and throttle decisions
//! - [`scheduler`] - dependency planning, dispatch loop and unit execution
//! - [`collectors`] - built-in collector units and the unit catalog
//! - [`state`] - status publisher, working directory and run log
//! - [`orchestrator`] - run lifecycle: start, stop, finalize
//! - [`report`] / [`packager`] - finalization artifacts
//! - [`api`] - Status/Control HTTP API
//! - [`config`] / [`cli`] - configuration and command line

pub mod api;
pub mod cli;
pub mod collectors;
pub mod config;
pub mod domain;
pub mod monitor;
pub mod orchestrator;
pub mod packager;
pub mod report;
pub mod scheduler;
pub mod state;

pub use config::Config;
pub use domain::{ProfileName, RunPhase, RunState, UnitStatus};
pub use orchestrator::{Orchestrator, OrchestratorError, RunHandle, RunRequest};

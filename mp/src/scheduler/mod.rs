//! Run scheduler
//!
//! Dispatches the units of a profile with a concurrency limit, dependency
//! ordering, per-unit deadlines and resource-aware admission.

mod core;
mod executor;
mod graph;

pub use core::{RunScheduler, SchedulerSettings, SchedulerStats};
pub use executor::{Executor, UnitOutcome, dir_size};
pub use graph::{DependencyPlan, plan};

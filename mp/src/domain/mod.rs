//! Domain types for maxprobe runs
//!
//! - `ProfileName`/`Profile`: which units a run includes and its limits
//! - `CollectorUnit`: one schedulable probe and its terminal `UnitResult`
//! - `RunState`: the single record of the active (or last) run
//! - `ResourceSample`: one CPU/memory/load reading

mod profile;
mod run;
mod sample;
mod unit;

pub use profile::{HardwareInfo, Profile, ProfileName, UnitSelection};
pub use run::{RunPhase, RunState};
pub use sample::ResourceSample;
pub use unit::{CollectorUnit, TransitionError, UnitKind, UnitResult, UnitStatus, Weight};

//! Run state ownership
//!
//! The `StatusPublisher` holds the one `RunState` readers see; `WorkDir`
//! owns the run's output tree and `RunLog` its textual log.

mod publisher;
mod runlog;
mod workdir;

pub use publisher::{PhaseError, StatusPublisher};
pub use runlog::{RunLog, tail_lines};
pub use workdir::{WorkDir, run_dir_name, sanitize_name};

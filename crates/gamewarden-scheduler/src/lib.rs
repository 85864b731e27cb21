//! Scheduler for the gamewarden supervisor.
//!
//! Provides:
//! - `Schedule` - the declarative schedule file
//! - `Scheduler` - trigger compilation and the run-loop
//! - Built-in actions available to every schedule

pub mod builtin;
pub mod schedule;
pub mod scheduler;

pub use schedule::{Entry, Schedule, ScheduleError, Trigger};
pub use scheduler::{BuildError, Scheduler};

//! Supervision of the game-server process.
//!
//! Provides:
//! - `ProcessSpec` - executable, working directory and parameters
//! - `Watcher` - launch, exit monitoring and restart
//! - Line-based forwarding of the child's output streams

pub mod command;
pub mod output;
pub mod watcher;

pub use command::{LaunchError, ProcessSpec, ResolvedCommand, resolve_executable_path};
pub use output::{OutputLine, OutputSink, Stream};
pub use watcher::{ExitCallback, OnExit, ProcessExit, ProcessState, Watcher, WatcherOptions};

//! Core abstractions shared by the gamewarden components.
//!
//! This crate provides the fundamental building blocks:
//! - `ActionRegistry` - Named actions contributed by components
//! - `Event` / `EventSender` - Named events that drive event triggers
//! - `QuitSignal` - The single process-wide termination notification
//! - `FailurePolicy` - What a fatal steady-state failure does to the process

pub mod action;
pub mod event;
pub mod quit;

pub use action::{Action, ActionError, ActionOutput, ActionProvider, ActionRegistry, FnAction};
pub use event::{Event, EventReceiver, EventSender};
pub use quit::{FailurePolicy, QuitReason, QuitSignal};

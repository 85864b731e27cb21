//! Named events raised by components and consumed by event triggers.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Well-known event names.
pub mod names {
    /// A chat line pushed by the game server.
    pub const CHAT: &str = "chat";
    /// A non-chat server message (player connects, kicks, bans, ...).
    pub const EVENT: &str = "event";
    /// The RCON session was (re)established.
    pub const RCON_CONNECTED: &str = "rcon.connected";
    /// The RCON session was lost.
    pub const RCON_DISCONNECTED: &str = "rcon.disconnected";
    /// The supervised process terminated.
    pub const PROCESS_EXITED: &str = "process.exited";
    /// The supervised process was relaunched.
    pub const PROCESS_RESTARTED: &str = "process.restarted";
}

/// A named event with a free-form text payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub payload: String,
}

impl Event {
    /// Create a new event.
    #[must_use]
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
        }
    }
}

/// Receiving half of an event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// Cloneable handle used to raise events.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    #[must_use]
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Raise an event. Returns `false` if nobody is listening any more.
    pub fn raise(&self, event: Event) -> bool {
        let name = event.name.clone();
        if self.tx.send(event).is_err() {
            tracing::debug!(event = %name, "Event dropped, receiver closed");
            return false;
        }
        true
    }

    /// Shorthand for raising `Event::new(name, payload)`.
    pub fn emit(&self, name: &str, payload: impl Into<String>) -> bool {
        self.raise(Event::new(name, payload))
    }
}

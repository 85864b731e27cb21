//! BattlEye RCON client for game-server supervision.
//!
//! Provides:
//! - Wire codec for the BattlEye RCON datagram format
//! - `Session` - authenticated transport session with keep-alive and resends
//! - `RconClient` - reconnect policy, subscribers and the `exec` action

pub mod client;
pub mod error;
pub mod protocol;
pub mod session;

pub use client::{ClientConfig, ExecError, Push, RconClient, SubscriberId};
pub use error::{ConnError, DecodeError, ReplyError, SendError, SessionLost};
pub use session::{
    Credentials, ReplyCallback, SequenceId, Session, SessionConfig, SessionEvent, SessionState,
};

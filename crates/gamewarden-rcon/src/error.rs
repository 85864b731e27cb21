//! RCON failure taxonomy.

use std::{io, net::SocketAddr, time::Duration};

use thiserror::Error;

/// Connection establishment error.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("Authentication rejected by {0}")]
    Auth(SocketAddr),
    #[error("No login response from {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },
    #[error("Cannot resolve RCON address: {0}")]
    Address(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,
}

impl ConnError {
    /// Whether another connection attempt may succeed.
    ///
    /// Rejected credentials and a spent reconnect budget are final.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_) | Self::Address(_))
    }
}

/// Error handing a command to the transport.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Session is not connected")]
    NotConnected,
    #[error("Sequence slot {0} is still awaiting acknowledgment")]
    WindowFull(u8),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure delivered to a command's reply continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("Session disconnected before a reply arrived")]
    Disconnected,
    #[error("No acknowledgment after {0} resends")]
    Timeout(u32),
}

/// Heartbeat failure: the session saw no traffic for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Session lost: no traffic for {silent_for:?} ({missed} keep-alive intervals)")]
pub struct SessionLost {
    pub silent_for: Duration,
    pub missed: u32,
}

/// Datagram decoding error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("Bad datagram header")]
    BadHeader,
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("Unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("Malformed packet: {0}")]
    Malformed(&'static str),
}

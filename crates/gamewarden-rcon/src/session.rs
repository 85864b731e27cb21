//! Authenticated RCON transport session over UDP.
//!
//! A [`Session`] owns the socket, the outgoing sequence counter and the map
//! of commands awaiting acknowledgment. Two background tasks run while the
//! session is connected: a reader that demultiplexes inbound datagrams, and
//! a heartbeat that probes the server, resends unacknowledged commands and
//! declares the session lost after too many silent intervals.

use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ConnError, ReplyError, SendError, SessionLost},
    protocol::{self, ClientPacket, MAX_DATAGRAM, MessageKind, Part, ServerPacket},
};

/// Session-lifetime identifier of an outgoing command.
///
/// Only the low byte travels on the wire.
pub type SequenceId = u64;

/// Continuation invoked exactly once with a command's reply or failure.
///
/// Runs on the session's reader task, so it must not block.
pub type ReplyCallback = Box<dyn FnOnce(Result<String, ReplyError>) + Send + 'static>;

/// How many recent server message sequence bytes are remembered for
/// duplicate suppression.
const RECENT_MESSAGES: usize = 64;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Authenticating,
    Connected,
    /// Heartbeat failure detected. Only leaves towards `Disconnected`.
    Degraded,
}

impl SessionState {
    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Authenticating)
                | (Self::Authenticating, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Degraded | Self::Disconnected)
                | (Self::Degraded, Self::Disconnected)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Timers governing a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keep-alive probes.
    pub keep_alive_timer: Duration,
    /// Silent intervals tolerated before the session is declared lost.
    pub keep_alive_tolerance: u32,
    /// Bound on the login exchange.
    pub login_timeout: Duration,
    /// Age after which an unacknowledged command is resent.
    pub resend_after: Duration,
    /// Resends before a command fails with [`ReplyError::Timeout`].
    pub max_resends: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_timer: Duration::from_secs(10),
            keep_alive_tolerance: 4,
            login_timeout: Duration::from_secs(5),
            resend_after: Duration::from_secs(10),
            max_resends: 3,
        }
    }
}

/// RCON credentials. The protocol has no username.
#[derive(Clone)]
pub struct Credentials {
    password: String,
}

impl Credentials {
    /// Create credentials from a password.
    #[must_use]
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"***")
            .finish()
    }
}

/// Signal from the session to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Chat line pushed by the server.
    Chat(String),
    /// Non-chat server message.
    Event(String),
    /// Heartbeat failure. The session is now degraded and must be closed.
    Lost(SessionLost),
}

struct PendingCommand {
    id: SequenceId,
    datagram: Bytes,
    on_reply: Option<ReplyCallback>,
    issued_at: Instant,
    last_sent: Instant,
    resends: u32,
    probe: bool,
    parts: Vec<Option<Bytes>>,
}

impl PendingCommand {
    /// Store a reply fragment; returns the joined reply once all parts arrived.
    fn accept_part(&mut self, part: Part, body: Bytes) -> Option<String> {
        let count = usize::from(part.count);
        if self.parts.len() != count {
            self.parts = vec![None; count];
        }
        self.parts[usize::from(part.index)] = Some(body);
        if !self.parts.iter().all(Option::is_some) {
            return None;
        }
        let joined: Vec<u8> = self
            .parts
            .iter()
            .flatten()
            .flat_map(|b| b.iter().copied())
            .collect();
        Some(String::from_utf8_lossy(&joined).into_owned())
    }
}

struct Inner {
    next_seq: SequenceId,
    pending: HashMap<u8, PendingCommand>,
    last_rx: Instant,
    recent_messages: VecDeque<u8>,
}

struct Shared {
    socket: UdpSocket,
    addr: SocketAddr,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
}

/// Handle to an authenticated RCON session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Authenticate against `addr` and start the background tasks.
    ///
    /// Returns the session together with the receiver of its
    /// [`SessionEvent`]s.
    ///
    /// # Errors
    /// `Auth` if the password is rejected, `Timeout` if no login reply
    /// arrives within `config.login_timeout`, `Io` on socket failures.
    pub async fn connect(
        addr: SocketAddr,
        credentials: &Credentials,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ConnError> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let (state, _) = watch::channel(SessionState::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            socket,
            addr,
            config,
            state,
            inner: Mutex::new(Inner {
                next_seq: 0,
                pending: HashMap::new(),
                last_rx: Instant::now(),
                recent_messages: VecDeque::with_capacity(RECENT_MESSAGES),
            }),
            events,
            cancel: CancellationToken::new(),
        });

        shared.transition(SessionState::Authenticating);
        tracing::debug!(%addr, "Authenticating RCON session");

        let login = ClientPacket::Login {
            password: &credentials.password,
        }
        .encode();
        let timeout = shared.config.login_timeout;
        let accepted = match time::timeout(timeout, shared.exchange_login(&login)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                shared.transition(SessionState::Disconnected);
                return Err(e.into());
            }
            Err(_) => {
                shared.transition(SessionState::Disconnected);
                return Err(ConnError::Timeout { addr, timeout });
            }
        };
        if !accepted {
            shared.transition(SessionState::Disconnected);
            return Err(ConnError::Auth(addr));
        }

        shared.lock().last_rx = Instant::now();
        shared.transition(SessionState::Connected);
        tracing::info!(%addr, "RCON session authenticated");

        tokio::spawn(Arc::clone(&shared).read_loop());
        tokio::spawn(Arc::clone(&shared).heartbeat_loop());

        Ok((Self { shared }, events_rx))
    }

    /// Send a command and return its sequence id once the datagram is out.
    ///
    /// `on_reply` is invoked exactly once, with the server's reply or with a
    /// failure if the session ends first. It is never invoked when this
    /// method returns an error.
    ///
    /// # Errors
    /// `NotConnected` unless the session is connected, `WindowFull` if the
    /// wire sequence slot is still in use, `Io` if the send fails.
    pub async fn send(
        &self,
        command: &str,
        on_reply: Option<ReplyCallback>,
    ) -> Result<SequenceId, SendError> {
        self.shared.issue(command, on_reply, false).await
    }

    /// Tear the session down, failing every outstanding command.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        let previous = self.shared.state.send_replace(SessionState::Disconnected);
        self.shared.fail_pending();
        if previous != SessionState::Disconnected {
            tracing::info!(addr = %self.shared.addr, from = %previous, "RCON session closed");
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Remote endpoint.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Commands (including probes) awaiting acknowledgment.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("addr", &self.shared.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                tracing::debug!(from = %state, to = %next, "Session state change");
                *state = next;
                true
            } else {
                false
            }
        })
    }

    async fn exchange_login(&self, login: &[u8]) -> io::Result<bool> {
        self.socket.send(login).await?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            match ServerPacket::decode(&buf[..len]) {
                Ok(ServerPacket::LoginReply { accepted }) => return Ok(accepted),
                Ok(other) => tracing::debug!(?other, "Ignoring packet before login reply"),
                Err(e) => tracing::debug!(error = %e, "Dropping invalid datagram"),
            }
        }
    }

    async fn issue(
        &self,
        command: &str,
        on_reply: Option<ReplyCallback>,
        probe: bool,
    ) -> Result<SequenceId, SendError> {
        let (id, seq, datagram) = {
            let mut inner = self.lock();
            // Checked under the lock so teardown cannot miss this entry.
            if self.state() != SessionState::Connected {
                return Err(SendError::NotConnected);
            }
            let id = inner.next_seq;
            let seq = id.to_le_bytes()[0];
            if inner.pending.contains_key(&seq) {
                return Err(SendError::WindowFull(seq));
            }
            inner.next_seq += 1;

            let datagram = ClientPacket::Command { seq, command }.encode();
            let now = Instant::now();
            inner.pending.insert(
                seq,
                PendingCommand {
                    id,
                    datagram: datagram.clone(),
                    on_reply,
                    issued_at: now,
                    last_sent: now,
                    resends: 0,
                    probe,
                    parts: Vec::new(),
                },
            );
            (id, seq, datagram)
        };

        if let Err(e) = self.socket.send(&datagram).await {
            self.lock().pending.remove(&seq);
            return Err(e.into());
        }
        tracing::trace!(id, seq, probe, "Command sent");
        Ok(id)
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                received = self.socket.recv(&mut buf) => match received {
                    Ok(len) => self.handle_datagram(&buf[..len]).await,
                    Err(e) => tracing::debug!(error = %e, "RCON receive failed"),
                },
            }
        }
        tracing::trace!(addr = %self.addr, "RCON reader stopped");
    }

    async fn handle_datagram(&self, datagram: &[u8]) {
        let packet = match ServerPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping invalid datagram");
                return;
            }
        };
        self.lock().last_rx = Instant::now();

        match packet {
            ServerPacket::CommandReply { seq, part, body } => {
                if let Some((on_reply, reply)) = self.resolve(seq, part, body) {
                    on_reply(Ok(reply));
                }
            }
            ServerPacket::Message { seq, body } => {
                let ack = ClientPacket::Ack { seq }.encode();
                if let Err(e) = self.socket.send(&ack).await {
                    tracing::warn!(seq, error = %e, "Failed to acknowledge server message");
                }
                if !self.first_sighting(seq) {
                    tracing::trace!(seq, "Suppressing repeated server message");
                    return;
                }
                let text = String::from_utf8_lossy(&body).into_owned();
                let event = match protocol::classify(&text) {
                    MessageKind::Chat => SessionEvent::Chat(text),
                    MessageKind::Event => SessionEvent::Event(text),
                };
                let _ = self.events.send(event);
            }
            ServerPacket::LoginReply { .. } => tracing::debug!("Ignoring late login reply"),
        }
    }

    /// Match an acknowledgment to its pending command by sequence byte.
    fn resolve(&self, seq: u8, part: Option<Part>, body: Bytes) -> Option<(ReplyCallback, String)> {
        let mut inner = self.lock();
        let Some(pending) = inner.pending.get_mut(&seq) else {
            tracing::trace!(seq, "Discarding duplicate or unknown acknowledgment");
            return None;
        };
        let reply = match part {
            Some(part) => pending.accept_part(part, body)?,
            None => String::from_utf8_lossy(&body).into_owned(),
        };
        let pending = inner.pending.remove(&seq)?;
        tracing::trace!(
            id = pending.id,
            seq,
            latency = ?pending.issued_at.elapsed(),
            "Command acknowledged"
        );
        pending.on_reply.map(|on_reply| (on_reply, reply))
    }

    fn first_sighting(&self, seq: u8) -> bool {
        let mut inner = self.lock();
        if inner.recent_messages.contains(&seq) {
            return false;
        }
        if inner.recent_messages.len() == RECENT_MESSAGES {
            inner.recent_messages.pop_front();
        }
        inner.recent_messages.push_back(seq);
        true
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = self.config.keep_alive_timer;
        let tolerance = self.config.keep_alive_tolerance.max(1);
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state() != SessionState::Connected {
                break;
            }

            let silent_for = self.lock().last_rx.elapsed();
            let missed = missed_intervals(silent_for, period);
            if missed >= tolerance {
                self.degrade(SessionLost { silent_for, missed });
                break;
            }

            self.resend_overdue().await;
            if let Err(e) = self.issue("", None, true).await {
                tracing::debug!(error = %e, "Keep-alive probe not sent");
            }
        }
        tracing::trace!(addr = %self.addr, "RCON heartbeat stopped");
    }

    async fn resend_overdue(&self) {
        let now = Instant::now();
        let resend_after = self.config.resend_after;
        let max_resends = self.config.max_resends;
        let mut resend = Vec::new();
        let mut expired = Vec::new();

        self.lock().pending.retain(|seq, pending| {
            if now.duration_since(pending.last_sent) < resend_after {
                return true;
            }
            if pending.probe {
                return false;
            }
            if pending.resends >= max_resends {
                expired.push((pending.id, pending.on_reply.take()));
                return false;
            }
            pending.resends += 1;
            pending.last_sent = now;
            resend.push((*seq, pending.datagram.clone()));
            true
        });

        for (id, on_reply) in expired {
            tracing::warn!(id, max_resends, "Command expired without acknowledgment");
            if let Some(on_reply) = on_reply {
                on_reply(Err(ReplyError::Timeout(max_resends)));
            }
        }
        for (seq, datagram) in resend {
            tracing::debug!(seq, "Resending unacknowledged command");
            if let Err(e) = self.socket.send(&datagram).await {
                tracing::warn!(seq, error = %e, "Resend failed");
            }
        }
    }

    fn degrade(&self, lost: SessionLost) {
        if !self.transition(SessionState::Degraded) {
            return;
        }
        tracing::warn!(
            addr = %self.addr,
            silent_for = ?lost.silent_for,
            missed = lost.missed,
            "RCON session degraded"
        );
        self.cancel.cancel();
        self.fail_pending();
        let _ = self.events.send(SessionEvent::Lost(lost));
    }

    fn fail_pending(&self) {
        let drained: Vec<PendingCommand> = self.lock().pending.drain().map(|(_, p)| p).collect();
        for pending in drained {
            if let Some(on_reply) = pending.on_reply {
                on_reply(Err(ReplyError::Disconnected));
            }
        }
    }
}

fn missed_intervals(silent_for: Duration, period: Duration) -> u32 {
    if period.is_zero() {
        return u32::MAX;
    }
    u32::try_from(silent_for.as_nanos() / period.as_nanos()).unwrap_or(u32::MAX)
}

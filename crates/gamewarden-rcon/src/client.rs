//! RCON client: connection policy, subscribers and contributed actions.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use gamewarden_core::{
    ActionError, ActionProvider, ActionRegistry, FailurePolicy, FnAction, QuitSignal,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{ConnError, ReplyError, SendError},
    session::{Credentials, ReplyCallback, Session, SessionConfig, SessionEvent, SessionState},
};

/// Subscriber identifier.
pub type SubscriberId = Uuid;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server's RCON endpoint.
    pub address: String,
    pub credentials: Credentials,
    pub session: SessionConfig,
    /// Reconnect attempts after a lost session before giving up.
    pub reconnect_attempts: u32,
    /// Fixed wait before each reconnect attempt.
    pub reconnect_interval: Duration,
    /// Broadcast with `say -1` after every successful connect.
    pub announce: Option<String>,
    /// What an exhausted reconnect budget does to the supervisor.
    pub failure_policy: FailurePolicy,
}

impl ClientConfig {
    /// Configuration with default timers and reconnect policy.
    #[must_use]
    pub fn new(address: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            credentials: Credentials::new(password),
            session: SessionConfig::default(),
            reconnect_attempts: 5,
            reconnect_interval: Duration::from_secs(10),
            announce: None,
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    Chat(String),
    Event(String),
    /// The session was lost; outstanding commands have failed.
    Disconnected,
    /// A new session replaced the lost one.
    Reconnected,
}

type Handler = Arc<dyn Fn(&Push) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    chat: Vec<(SubscriberId, Handler)>,
    events: Vec<(SubscriberId, Handler)>,
}

struct ClientInner {
    config: ClientConfig,
    session: RwLock<Option<Session>>,
    subscribers: RwLock<Subscribers>,
    quit: QuitSignal,
    cancel: CancellationToken,
}

/// RCON client. Cheap to clone.
#[derive(Clone)]
pub struct RconClient {
    inner: Arc<ClientInner>,
}

impl RconClient {
    /// Create a disconnected client. Its tasks stop when `quit` is raised.
    #[must_use]
    pub fn new(config: ClientConfig, quit: QuitSignal) -> Self {
        let cancel = quit.token().child_token();
        Self {
            inner: Arc::new(ClientInner {
                config,
                session: RwLock::new(None),
                subscribers: RwLock::new(Subscribers::default()),
                quit,
                cancel,
            }),
        }
    }

    /// Establish the session and start supervising it.
    ///
    /// # Errors
    /// Returns the session's connection error; nothing is retried here.
    /// `Cancelled` once the client has been disconnected.
    pub async fn connect(&self) -> Result<(), ConnError> {
        let events = self.open_session().await?;
        tokio::spawn(self.clone().supervise(events));
        self.announce().await;
        Ok(())
    }

    /// Send `command` and return once it is on the wire.
    ///
    /// `on_reply` is invoked exactly once with the server's reply, or with
    /// a failure if the session drops first. It is not invoked when this
    /// returns an error.
    ///
    /// # Errors
    /// `SendError::NotConnected` while no session is connected.
    pub async fn exec(
        &self,
        command: &str,
        on_reply: Option<ReplyCallback>,
    ) -> Result<(), SendError> {
        let session = self.session().ok_or(SendError::NotConnected)?;
        session.send(command, on_reply).await?;
        Ok(())
    }

    /// Send `command` and wait for the reply.
    ///
    /// # Errors
    /// Returns the send error, or the reply failure.
    pub async fn exec_and_wait(&self, command: &str) -> Result<String, ExecError> {
        let (tx, rx) = oneshot::channel();
        self.exec(
            command,
            Some(Box::new(move |reply| {
                let _ = tx.send(reply);
            })),
        )
        .await?;
        rx.await.map_err(|_| ReplyError::Disconnected)?.map_err(Into::into)
    }

    /// Subscribe to non-chat server messages.
    pub fn attach_events<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.write_subscribers().events.push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to chat messages.
    pub fn attach_chat<F>(&self, handler: F) -> SubscriberId
    where
        F: Fn(&Push) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.write_subscribers().chat.push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut subs = self.write_subscribers();
        let before = subs.chat.len() + subs.events.len();
        subs.chat.retain(|(sid, _)| *sid != id);
        subs.events.retain(|(sid, _)| *sid != id);
        before != subs.chat.len() + subs.events.len()
    }

    /// Close the session and stop supervision. Outstanding commands fail.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
        if let Some(session) = self.take_session() {
            session.close();
        }
        self.write_subscribers().chat.clear();
        self.write_subscribers().events.clear();
    }

    /// State of the current session.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session()
            .map_or(SessionState::Disconnected, |s| s.state())
    }

    fn session(&self) -> Option<Session> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_session(&self) -> Option<Session> {
        self.inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, Subscribers> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_session(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, ConnError> {
        let addr = resolve(&self.inner.config.address).await?;
        tracing::info!(%addr, "Establishing RCON connection");
        let (session, events) = tokio::select! {
            () = self.inner.cancel.cancelled() => return Err(ConnError::Cancelled),
            connected = Session::connect(
                addr,
                &self.inner.config.credentials,
                self.inner.config.session.clone(),
            ) => connected?,
        };

        // Checked under the lock so a concurrent disconnect either sees this
        // session or this session sees the cancellation.
        let previous = {
            let mut slot = self
                .inner
                .session
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.cancel.is_cancelled() {
                drop(slot);
                session.close();
                return Err(ConnError::Cancelled);
            }
            slot.replace(session)
        };
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(events)
    }

    async fn announce(&self) {
        let Some(message) = self.inner.config.announce.as_deref() else {
            return;
        };
        if let Err(e) = self.exec(&format!("say -1 {message}"), None).await {
            tracing::warn!(error = %e, "Failed to announce readiness");
        }
    }

    async fn supervise(self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        loop {
            let event = tokio::select! {
                () = self.inner.cancel.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Some(SessionEvent::Chat(line)) => self.dispatch_chat(&Push::Chat(line)),
                Some(SessionEvent::Event(line)) => self.dispatch_events(&Push::Event(line)),
                Some(SessionEvent::Lost(lost)) => {
                    tracing::warn!(error = %lost, "RCON session lost");
                    match self.recover().await {
                        Some(next) => events = next,
                        None => return,
                    }
                }
                None => {
                    tracing::warn!("RCON session event stream closed");
                    match self.recover().await {
                        Some(next) => events = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Tear down the lost session and run the reconnect policy.
    async fn recover(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        if let Some(session) = self.take_session() {
            session.close();
        }
        self.broadcast(&Push::Disconnected);

        match self.reconnect().await {
            Ok(events) => {
                self.broadcast(&Push::Reconnected);
                self.announce().await;
                Some(events)
            }
            Err(e) => {
                if !self.inner.cancel.is_cancelled() {
                    tracing::error!(error = %e, "RCON reconnect failed");
                    self.inner
                        .quit
                        .report_fatal("rcon", &e, self.inner.config.failure_policy);
                }
                None
            }
        }
    }

    async fn reconnect(&self) -> Result<mpsc::UnboundedReceiver<SessionEvent>, ConnError> {
        let attempts = self.inner.config.reconnect_attempts;
        for attempt in 1..=attempts {
            tokio::select! {
                () = self.inner.cancel.cancelled() => {
                    return Err(ConnError::ReconnectExhausted { attempts: attempt - 1 });
                }
                () = tokio::time::sleep(self.inner.config.reconnect_interval) => {}
            }
            tracing::info!(attempt, attempts, "Reconnecting RCON session");
            match self.open_session().await {
                Ok(events) => return Ok(events),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(attempt, error = %e, "RCON reconnect attempt failed");
                }
                Err(e) => return Err(e),
            }
        }
        Err(ConnError::ReconnectExhausted { attempts })
    }

    fn dispatch_chat(&self, push: &Push) {
        let handlers: Vec<Handler> = self.read_handlers(|s| &s.chat);
        for handler in handlers {
            handler(push);
        }
    }

    fn dispatch_events(&self, push: &Push) {
        let handlers: Vec<Handler> = self.read_handlers(|s| &s.events);
        for handler in handlers {
            handler(push);
        }
    }

    fn broadcast(&self, push: &Push) {
        self.dispatch_chat(push);
        self.dispatch_events(push);
    }

    fn read_handlers(
        &self,
        pick: impl Fn(&Subscribers) -> &Vec<(SubscriberId, Handler)>,
    ) -> Vec<Handler> {
        let subs = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        pick(&*subs).iter().map(|(_, h)| Arc::clone(h)).collect()
    }
}

impl fmt::Debug for RconClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RconClient")
            .field("address", &self.inner.config.address)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ActionProvider for RconClient {
    fn actions(&self) -> ActionRegistry {
        let mut registry = ActionRegistry::new();

        let client = self.clone();
        registry.register(
            "exec",
            FnAction::new(move |args: Vec<String>| {
                let client = client.clone();
                async move {
                    if args.is_empty() {
                        return Err(ActionError::InvalidArgs("exec needs a command".into()));
                    }
                    let reply = client.exec_and_wait(&args.join(" ")).await?;
                    Ok(Some(reply))
                }
            }),
        );

        let client = self.clone();
        registry.register(
            "say",
            FnAction::new(move |args: Vec<String>| {
                let client = client.clone();
                async move {
                    client.exec_and_wait(&format!("say -1 {}", args.join(" "))).await?;
                    Ok::<_, ActionError>(None)
                }
            }),
        );

        registry
    }
}

/// Failure of [`RconClient::exec_and_wait`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Reply(#[from] ReplyError),
}

impl From<ExecError> for ActionError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Send(e) => Self::Unavailable(e.to_string()),
            ExecError::Reply(e) => Self::Failed(e.to_string()),
        }
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, ConnError> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| ConnError::Address(format!("{address}: {e}")))?
        .next()
        .ok_or_else(|| ConnError::Address(address.to_string()))
}

//! Process-wide termination signal.
//!
//! Every component receives a [`QuitSignal`] at construction. Any fatal
//! condition raises it; the binary waits on it and shuts down in order.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Why the supervisor is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuitReason {
    /// Orderly stop (signal, operator request).
    Requested(String),
    /// A component hit a failure it cannot recover from.
    Fatal { component: String, error: String },
}

impl QuitReason {
    /// Whether the reason is a fatal failure.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl fmt::Display for QuitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested(why) => write!(f, "stop requested: {why}"),
            Self::Fatal { component, error } => write!(f, "fatal error in {component}: {error}"),
        }
    }
}

/// What a component does when it hits a fatal steady-state failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Raise the quit signal and stop the whole supervisor.
    #[default]
    Shutdown,
    /// Log the failure and keep the other components running.
    Disable,
}

/// Single shared quit notification. The first reason raised wins.
#[derive(Clone, Default)]
pub struct QuitSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<QuitReason>>>,
}

impl QuitSignal {
    /// Create a new, unraised signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Later reasons are logged and discarded.
    pub fn raise(&self, reason: QuitReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(first) = slot.as_ref() {
                tracing::debug!(%first, ignored = %reason, "Quit already raised");
                return;
            }
            tracing::info!(%reason, "Quit raised");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    /// Report a fatal component failure, honoring the failure policy.
    pub fn report_fatal(&self, component: &str, error: impl fmt::Display, policy: FailurePolicy) {
        match policy {
            FailurePolicy::Shutdown => self.raise(QuitReason::Fatal {
                component: component.to_string(),
                error: error.to_string(),
            }),
            FailurePolicy::Disable => {
                tracing::error!(component, %error, "Component disabled after fatal failure");
            }
        }
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason, once raised.
    #[must_use]
    pub fn reason(&self) -> Option<QuitReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A token cancelled when the signal is raised.
    ///
    /// Child tokens let components cancel their own tasks without
    /// raising the process-wide signal.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until the signal is raised and return its reason.
    pub async fn wait(&self) -> QuitReason {
        self.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| QuitReason::Requested("cancelled".to_string()))
    }
}

impl fmt::Debug for QuitSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuitSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

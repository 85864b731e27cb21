//! Named actions and the registry the scheduler invokes them through.

use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

/// Action invocation error.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Component unavailable: {0}")]
    Unavailable(String),
    #[error("Action failed: {0}")]
    Failed(String),
}

/// Output of a successful invocation, if the action produces any.
pub type ActionOutput = Option<String>;

/// Something the scheduler can invoke by name with a positional argument list.
#[async_trait]
pub trait Action: Send + Sync {
    /// Run the action.
    async fn invoke(&self, args: &[String]) -> Result<ActionOutput, ActionError>;

    /// Whether two fires of the same trigger may run this action concurrently.
    ///
    /// Defaults to `false`: overlapping fires are serialized per trigger.
    fn concurrent_safe(&self) -> bool {
        false
    }
}

/// Adapter turning an async closure into an [`Action`].
pub struct FnAction<F> {
    f: F,
    concurrent_safe: bool,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send + 'static,
{
    /// Wrap a closure.
    #[must_use]
    pub fn new(f: F) -> Self {
        Self {
            f,
            concurrent_safe: false,
        }
    }

    /// Allow overlapping invocations of this action.
    #[must_use]
    pub fn concurrent(mut self) -> Self {
        self.concurrent_safe = true;
        self
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput, ActionError>> + Send + 'static,
{
    async fn invoke(&self, args: &[String]) -> Result<ActionOutput, ActionError> {
        (self.f)(args.to_vec()).await
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent_safe
    }
}

/// Mapping from unique action name to an invocable action.
///
/// Populated during configuration and treated as read-only once the
/// scheduler has compiled its triggers. Cloning is cheap: entries are
/// reference counted.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action, replacing any previous entry with the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        action: impl Action + 'static,
    ) -> &mut Self {
        self.insert(name, Arc::new(action));
        self
    }

    /// Insert an already shared action.
    pub fn insert(&mut self, name: impl Into<String>, action: Arc<dyn Action>) {
        let name = name.into();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::debug!(action = %name, "Replaced registered action");
        }
    }

    /// Merge another registry into this one. Last registration wins.
    pub fn merge(&mut self, other: Self) {
        for (name, action) in other.actions {
            self.insert(name, action);
        }
    }

    /// Look up an action by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Whether an action with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Implemented by components that contribute actions to the scheduler.
pub trait ActionProvider {
    /// The actions this component exposes, keyed by name.
    fn actions(&self) -> ActionRegistry;
}

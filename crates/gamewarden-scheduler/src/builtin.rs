//! Actions every schedule can use.

use gamewarden_core::{ActionError, ActionRegistry, FnAction};

/// The built-in actions: `log`.
#[must_use]
pub fn actions() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(
        "log",
        FnAction::new(|args: Vec<String>| async move {
            tracing::info!(target: "schedule", "{}", args.join(" "));
            Ok::<_, ActionError>(None)
        })
        .concurrent(),
    );
    registry
}

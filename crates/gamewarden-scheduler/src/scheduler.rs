//! Trigger compilation and the run-loop.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use gamewarden_core::{Action, ActionRegistry, EventReceiver, EventSender};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    builtin,
    schedule::{Schedule, Trigger, parse_cron},
};

/// Placeholder in event-trigger arguments replaced by the event payload.
const PAYLOAD_PLACEHOLDER: &str = "{payload}";

/// Trigger compilation error.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Entry {entry} references unknown action {action:?}")]
    UnknownAction { entry: String, action: String },
    #[error("Entry {entry}: invalid cron expression: {error}")]
    InvalidCron { entry: String, error: String },
}

/// A compiled entry: the resolved action, its arguments and the guard
/// serializing overlapping fires.
struct Fire {
    label: String,
    action_name: String,
    action: Arc<dyn Action>,
    args: Vec<String>,
    guard: Mutex<()>,
}

impl Fire {
    fn args_with(&self, payload: Option<&str>) -> Vec<String> {
        match payload {
            Some(payload) => self
                .args
                .iter()
                .map(|arg| arg.replace(PAYLOAD_PLACEHOLDER, payload))
                .collect(),
            None => self.args.clone(),
        }
    }

    async fn run(&self, args: Vec<String>) {
        let _serial = if self.action.concurrent_safe() {
            None
        } else {
            Some(self.guard.lock().await)
        };
        tracing::debug!(entry = %self.label, action = %self.action_name, ?args, "Trigger fired");
        match self.action.invoke(&args).await {
            Ok(Some(output)) => {
                tracing::info!(
                    entry = %self.label,
                    action = %self.action_name,
                    %output,
                    "Action completed"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    entry = %self.label,
                    action = %self.action_name,
                    error = %e,
                    "Action failed"
                );
            }
        }
    }
}

enum When {
    Cron(Box<cron::Schedule>),
    At(DateTime<Utc>),
}

impl When {
    /// First fire strictly after `after`.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(schedule) => schedule.after(&after).next(),
            Self::At(at) => (*at > after).then_some(*at),
        }
    }
}

struct Timer {
    fire: Arc<Fire>,
    when: When,
    next: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Compiled {
    timers: Vec<Timer>,
    on_event: HashMap<String, Vec<Arc<Fire>>>,
}

/// Holds the action registry and the schedule; runs compiled triggers.
///
/// Actions are merged with [`update_funcs`](Self::update_funcs) during
/// configuration. [`start`](Self::start) consumes the scheduler, so the
/// registry cannot change once the run-loop is going.
pub struct Scheduler {
    schedule: Schedule,
    registry: ActionRegistry,
    compiled: Option<Compiled>,
    events: EventSender,
    event_rx: EventReceiver,
}

impl Scheduler {
    /// Create a scheduler with the built-in actions plus `actions`.
    #[must_use]
    pub fn new(schedule: Schedule, actions: ActionRegistry) -> Self {
        let mut registry = builtin::actions();
        registry.merge(actions);
        let (events, event_rx) = EventSender::channel();
        Self {
            schedule,
            registry,
            compiled: None,
            events,
            event_rx,
        }
    }

    /// Merge actions contributed by another component. Last registration
    /// for a name wins. Invalidates previously compiled triggers.
    pub fn update_funcs(&mut self, actions: ActionRegistry) {
        tracing::debug!(contributed = ?actions.names(), "Merging actions");
        self.registry.merge(actions);
        self.compiled = None;
    }

    /// The current registry.
    #[must_use]
    pub const fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Handle for raising events that drive event triggers.
    #[must_use]
    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Compile the schedule against the registry. Returns the number of
    /// runnable triggers.
    ///
    /// # Errors
    /// `UnknownAction` if an entry names an action that is not registered.
    pub fn build_events(&mut self) -> Result<usize, BuildError> {
        let now = Utc::now();
        let mut compiled = Compiled::default();

        for (index, entry) in self.schedule.entries.iter().enumerate() {
            let label = entry.label(index);
            let action = self
                .registry
                .get(&entry.action)
                .ok_or_else(|| BuildError::UnknownAction {
                    entry: label.clone(),
                    action: entry.action.clone(),
                })?;
            let fire = Arc::new(Fire {
                label: label.clone(),
                action_name: entry.action.clone(),
                action,
                args: entry.args.clone(),
                guard: Mutex::new(()),
            });

            let when = match &entry.trigger {
                Trigger::Event(name) => {
                    compiled.on_event.entry(name.clone()).or_default().push(fire);
                    continue;
                }
                Trigger::Cron(expression) => When::Cron(Box::new(
                    parse_cron(expression).map_err(|error| BuildError::InvalidCron {
                        entry: label.clone(),
                        error,
                    })?,
                )),
                Trigger::At(at) => When::At(*at),
            };
            let next = when.next_after(now);
            if next.is_none() {
                tracing::warn!(entry = %label, trigger = %entry.trigger, "Trigger will never fire");
            }
            compiled.timers.push(Timer { fire, when, next });
        }

        let count = compiled.timers.len() + compiled.on_event.values().map(Vec::len).sum::<usize>();
        tracing::info!(
            triggers = count,
            timed = compiled.timers.len(),
            events = ?compiled.on_event.keys().collect::<Vec<_>>(),
            "Schedule compiled"
        );
        self.compiled = Some(compiled);
        Ok(count)
    }

    /// Start the run-loop. Compiles the schedule first if needed.
    ///
    /// Cancelling `cancel` stops the time loop, the event loop and any
    /// action still running.
    ///
    /// # Errors
    /// Returns the compilation error.
    pub fn start(mut self, cancel: CancellationToken) -> Result<JoinHandle<()>, BuildError> {
        if self.compiled.is_none() {
            self.build_events()?;
        }
        let compiled = self.compiled.take().unwrap_or_default();
        let event_rx = self.event_rx;

        Ok(tokio::spawn(async move {
            let tracker = TaskTracker::new();
            tokio::join!(
                run_timers(compiled.timers, &tracker, &cancel),
                run_events(event_rx, &compiled.on_event, &tracker, &cancel),
            );
            tracker.close();
            tracker.wait().await;
            tracing::info!("Scheduler stopped");
        }))
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.schedule.entries.len())
            .field("registry", &self.registry)
            .field("compiled", &self.compiled.is_some())
            .finish_non_exhaustive()
    }
}

fn spawn_fire(
    fire: &Arc<Fire>,
    payload: Option<&str>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) {
    let fire = Arc::clone(fire);
    let args = fire.args_with(payload);
    let cancel = cancel.clone();
    tracker.spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(entry = %fire.label, "Action abandoned on shutdown");
            }
            () = fire.run(args) => {}
        }
    });
}

/// Sleep until the earliest next fire, fire everything due, repeat.
async fn run_timers(mut timers: Vec<Timer>, tracker: &TaskTracker, cancel: &CancellationToken) {
    loop {
        let Some(due) = timers.iter().filter_map(|t| t.next).min() else {
            cancel.cancelled().await;
            return;
        };
        let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(wait) => {}
        }

        let now = Utc::now();
        for timer in &mut timers {
            if timer.next.is_some_and(|next| next <= now) {
                spawn_fire(&timer.fire, None, tracker, cancel);
                // Fires missed while sleeping are skipped, not replayed.
                timer.next = timer.when.next_after(now);
            }
        }
    }
}

async fn run_events(
    mut rx: EventReceiver,
    on_event: &HashMap<String, Vec<Arc<Fire>>>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return,
            event = rx.recv() => event,
        };
        let Some(event) = event else {
            tracing::debug!("Event channel closed");
            cancel.cancelled().await;
            return;
        };
        let Some(fires) = on_event.get(&event.name) else {
            tracing::trace!(event = %event.name, "No trigger bound to event");
            continue;
        };
        for fire in fires {
            spawn_fire(fire, Some(&event.payload), tracker, cancel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gamewarden_core::{ActionError, FnAction, event::names};
    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::schedule::Entry;

    fn entry(trigger: Trigger, action: &str, args: &[&str]) -> Entry {
        Entry {
            name: None,
            trigger,
            action: action.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        }
    }

    fn schedule(entries: Vec<Entry>) -> Schedule {
        Schedule { entries }
    }

    /// An action that reports every invocation's arguments.
    fn recorder(name: &str) -> (ActionRegistry, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = ActionRegistry::new();
        registry.register(
            name,
            FnAction::new(move |args: Vec<String>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(args);
                    Ok::<_, ActionError>(None)
                }
            }),
        );
        (registry, rx)
    }

    /// A slow action that records the highest number of overlapping runs.
    fn overlap_probe(concurrent: bool) -> (ActionRegistry, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let action = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            FnAction::new(move |_args: Vec<String>| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let done = Arc::clone(&done);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ActionError>(None)
                }
            })
        };
        let action = if concurrent { action.concurrent() } else { action };
        let mut registry = ActionRegistry::new();
        registry.register("slow", action);
        (registry, peak, done)
    }

    async fn wait_for(counter: &AtomicUsize, want: usize) {
        timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) < want {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("counter reached in time");
    }

    #[test]
    fn test_unknown_action_fails_build() {
        let mut scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::Event("chat".into()), "exec", &[])]),
            ActionRegistry::new(),
        );
        let err = tokio_test::assert_err!(scheduler.build_events());
        assert!(matches!(err, BuildError::UnknownAction { ref action, .. } if action == "exec"));

        let (exec, _rx) = recorder("exec");
        scheduler.update_funcs(exec);
        assert_eq!(tokio_test::assert_ok!(scheduler.build_events()), 1);
    }

    #[test]
    fn test_cron_is_evaluated_in_utc() {
        use chrono::TimeZone;

        let when = When::Cron(Box::new(parse_cron("0 0 6 * * *").unwrap()));
        let after = Utc.with_ymd_and_hms(2030, 1, 1, 5, 59, 0).unwrap();
        assert_eq!(
            when.next_after(after),
            Some(Utc.with_ymd_and_hms(2030, 1, 1, 6, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_builtins_registered() {
        let scheduler = Scheduler::new(Schedule::default(), ActionRegistry::new());
        assert!(scheduler.registry().contains("log"));
    }

    #[tokio::test]
    async fn test_at_trigger_fires_once() {
        let at = Utc::now() + chrono::Duration::milliseconds(200);
        let mut scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::At(at), "log", &["hello"])]),
            ActionRegistry::new(),
        );
        // Replace the built-in so invocations can be observed.
        let (log, mut calls) = recorder("log");
        scheduler.update_funcs(log);
        scheduler.build_events().unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        let args = timeout(Duration::from_secs(2), calls.recv()).await.unwrap().unwrap();
        assert_eq!(args, vec!["hello"]);
        assert!(Utc::now() >= at);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(calls.try_recv().is_err());

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cron_trigger_repeats() {
        let (tick, mut calls) = recorder("tick");
        let scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::Cron("* * * * * *".into()), "tick", &[])]),
            tick,
        );
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        for _ in 0..2 {
            timeout(Duration::from_secs(3), calls.recv()).await.unwrap().unwrap();
        }
        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_event_trigger_substitutes_payload() {
        let (say, mut calls) = recorder("say");
        let scheduler = Scheduler::new(
            schedule(vec![
                entry(
                    Trigger::Event(names::PROCESS_EXITED.into()),
                    "say",
                    &["server exited:", "{payload}"],
                ),
                entry(Trigger::Event(names::CHAT.into()), "say", &["unrelated"]),
            ]),
            say,
        );
        let events = scheduler.events();
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        events.emit(names::PROCESS_EXITED, "signal: 9 (SIGKILL)");
        events.emit("unbound", "ignored");

        let args = timeout(Duration::from_secs(2), calls.recv()).await.unwrap().unwrap();
        assert_eq!(args, vec!["server exited:", "signal: 9 (SIGKILL)"]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(calls.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_fires_are_serialized() {
        let (slow, peak, done) = overlap_probe(false);
        let scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::Event("tick".into()), "slow", &[])]),
            slow,
        );
        let events = scheduler.events();
        let handle_cancel = CancellationToken::new();
        let handle = scheduler.start(handle_cancel.clone()).unwrap();

        for _ in 0..3 {
            events.emit("tick", "");
        }
        wait_for(&done, 3).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        handle_cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_safe_actions_may_overlap() {
        let (slow, peak, done) = overlap_probe(true);
        let scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::Event("tick".into()), "slow", &[])]),
            slow,
        );
        let events = scheduler.events();
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        for _ in 0..3 {
            events.emit("tick", "");
        }
        wait_for(&done, 3).await;
        assert!(peak.load(Ordering::SeqCst) > 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_action_is_isolated() {
        let mut actions = ActionRegistry::new();
        actions.register(
            "broken",
            FnAction::new(|_args: Vec<String>| async move {
                Err(ActionError::Failed("boom".into()))
            }),
        );
        let (ok, mut calls) = recorder("ok");
        actions.merge(ok);

        let scheduler = Scheduler::new(
            schedule(vec![
                entry(Trigger::Event("go".into()), "broken", &[]),
                entry(Trigger::Event("go".into()), "ok", &["{payload}"]),
            ]),
            actions,
        );
        let events = scheduler.events();
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        for round in ["first", "second"] {
            events.emit("go", round);
            let args = timeout(Duration::from_secs(2), calls.recv()).await.unwrap().unwrap();
            assert_eq!(args, vec![round]);
        }
        assert!(!handle.is_finished());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_abandons_running_action() {
        let mut actions = ActionRegistry::new();
        actions.register(
            "hang",
            FnAction::new(|_args: Vec<String>| async move {
                std::future::pending::<()>().await;
                Ok(None)
            }),
        );
        let scheduler = Scheduler::new(
            schedule(vec![entry(Trigger::Event("go".into()), "hang", &[])]),
            actions,
        );
        let events = scheduler.events();
        let cancel = CancellationToken::new();
        let handle = scheduler.start(cancel.clone()).unwrap();

        events.emit("go", "");
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}

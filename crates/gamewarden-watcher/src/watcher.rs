//! Launch, exit monitoring and restart of the supervised process.
//!
//! Each launch gets a reaper task that owns the child and publishes how it
//! ended. Kills requested by the watcher are reported as such and never
//! reach the exit handler, so `restart` and `stop` cannot trigger an
//! automatic relaunch.

use std::{
    fmt,
    process::{ExitStatus, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use gamewarden_core::{
    ActionError, ActionProvider, ActionRegistry, EventSender, FailurePolicy, FnAction, QuitSignal,
    event::names,
};
use tokio::{process::Command, sync::watch};
use tokio_util::sync::CancellationToken;

use crate::{
    command::{LaunchError, ProcessSpec},
    output::{self, OutputSink, Stream},
};

/// Monitoring state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Restarting,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Restarting => "restarting",
        })
    }
}

/// How a launch terminated on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: Option<u32>,
    /// `None` if the exit status could not be collected.
    pub status: Option<ExitStatus>,
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status}"),
            None => f.write_str("unknown exit status"),
        }
    }
}

/// Exit notification callback.
pub type ExitCallback = Arc<dyn Fn(&ProcessExit) + Send + Sync>;

/// What happens when the process exits on its own.
#[derive(Clone)]
pub enum OnExit {
    /// Invoke the callback and stop monitoring.
    Notify(ExitCallback),
    /// Relaunch and keep watching, indefinitely.
    RestartAndWatch,
}

impl fmt::Debug for OnExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify(_) => f.write_str("Notify(..)"),
            Self::RestartAndWatch => f.write_str("RestartAndWatch"),
        }
    }
}

/// Optional collaborators of a [`Watcher`].
#[derive(Debug, Clone, Default)]
pub struct WatcherOptions {
    pub sink: OutputSink,
    /// Receives `process.exited` and `process.restarted`.
    pub events: Option<EventSender>,
    /// Applied when an automatic restart fails.
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Copy)]
enum Termination {
    Exited(ProcessExit),
    Killed,
}

struct Launch {
    generation: u64,
    pid: Option<u32>,
    kill: CancellationToken,
    exit: watch::Receiver<Option<Termination>>,
}

struct WatcherInner {
    spec: ProcessSpec,
    options: WatcherOptions,
    quit: QuitSignal,
    cancel: CancellationToken,
    state: watch::Sender<ProcessState>,
    launch: tokio::sync::Mutex<Option<Launch>>,
    on_exit: Mutex<Option<OnExit>>,
    pid: AtomicU32,
    launches: AtomicU32,
    generation: AtomicU64,
}

/// Process watcher. Cheap to clone.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    /// Create a watcher. Nothing is launched until [`exec`](Self::exec).
    #[must_use]
    pub fn new(spec: ProcessSpec, options: WatcherOptions, quit: QuitSignal) -> Self {
        let cancel = quit.token().child_token();
        let (state, _) = watch::channel(ProcessState::Stopped);
        Self {
            inner: Arc::new(WatcherInner {
                spec,
                options,
                quit,
                cancel,
                state,
                launch: tokio::sync::Mutex::new(None),
                on_exit: Mutex::new(None),
                pid: AtomicU32::new(0),
                launches: AtomicU32::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start the process.
    ///
    /// # Errors
    /// `AlreadyRunning` if a launch is live, otherwise the resolve or spawn
    /// failure.
    pub async fn exec(&self) -> Result<(), LaunchError> {
        let mut slot = self.inner.launch.lock().await;
        if slot.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }
        *slot = Some(self.launch().await?);
        Ok(())
    }

    /// Monitor the running process and apply `on_exit` when it terminates
    /// on its own. The handler is kept and re-attached after restarts.
    ///
    /// # Errors
    /// `NotRunning` if there is nothing to watch.
    pub async fn watch(&self, on_exit: OnExit) -> Result<(), LaunchError> {
        let slot = self.inner.launch.lock().await;
        let launch = slot.as_ref().ok_or(LaunchError::NotRunning)?;
        tracing::debug!(pid = ?launch.pid, ?on_exit, "Watching process");
        *self.lock_handler() = Some(on_exit);
        tokio::spawn(self.clone().monitor(launch.generation, launch.exit.clone()));
        Ok(())
    }

    /// Launch and watch with automatic restart.
    ///
    /// # Errors
    /// Returns the launch failure.
    pub async fn restart_and_watch(&self) -> Result<(), LaunchError> {
        self.exec().await?;
        self.watch(OnExit::RestartAndWatch).await
    }

    /// Kill the current process tree (if any), launch again and re-attach
    /// the exit handler. Returns the new process id when known.
    ///
    /// # Errors
    /// Returns the launch failure; the watcher is then stopped and the
    /// failure is reported to the quit signal.
    pub async fn restart(&self) -> Result<Option<u32>, LaunchError> {
        let (generation, pid, exit) = {
            let mut slot = self.inner.launch.lock().await;
            self.set_state(ProcessState::Restarting);
            if let Some(previous) = slot.take() {
                tracing::info!(pid = ?previous.pid, "Stopping process for restart");
                terminate(previous).await;
                self.inner.pid.store(0, Ordering::SeqCst);
            }
            let launch = match self.launch().await {
                Ok(launch) => launch,
                Err(e) => {
                    self.set_state(ProcessState::Stopped);
                    if !self.inner.cancel.is_cancelled() {
                        tracing::error!(error = %e, "Restart failed");
                        self.inner
                            .quit
                            .report_fatal("watcher", &e, self.inner.options.failure_policy);
                    }
                    return Err(e);
                }
            };
            let attached = (launch.generation, launch.pid, launch.exit.clone());
            *slot = Some(launch);
            attached
        };

        self.emit(names::PROCESS_RESTARTED, pid.map(|p| p.to_string()).unwrap_or_default());
        if self.handler().is_some() {
            tokio::spawn(self.clone().monitor(generation, exit));
        }
        Ok(pid)
    }

    /// Kill the current process tree without triggering the exit handler.
    /// Returns whether a process was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.inner.launch.lock().await;
        let Some(launch) = slot.take() else {
            return false;
        };
        tracing::info!(pid = ?launch.pid, "Stopping process");
        terminate(launch).await;
        self.inner.pid.store(0, Ordering::SeqCst);
        self.set_state(ProcessState::Stopped);
        true
    }

    /// Stop monitoring, output forwarding and any pending restart, then
    /// kill the process.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.stop().await;
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ProcessState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.state.subscribe()
    }

    /// OS id of the running process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.inner.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Successful launches so far, restarts included.
    #[must_use]
    pub fn launch_count(&self) -> u32 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    /// Spawn the child with its reaper and output forwarders.
    async fn launch(&self) -> Result<Launch, LaunchError> {
        if self.inner.cancel.is_cancelled() {
            return Err(LaunchError::NotRunning);
        }
        let resolved = self.inner.spec.resolve().await?;
        let sink = &self.inner.options.sink;

        let mut command = Command::new(&resolved.program);
        command
            .args(&resolved.args)
            .current_dir(&resolved.dir)
            .stdin(Stdio::null());
        if sink.captures() {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = command.group_spawn()?;
        let pid = child.id();
        let kill = self.inner.cancel.child_token();

        if let Some(stdout) = child.inner().stdout.take() {
            output::forward(stdout, Stream::Stdout, sink.clone(), kill.clone());
        }
        if let Some(stderr) = child.inner().stderr.take() {
            output::forward(stderr, Stream::Stderr, sink.clone(), kill.clone());
        }

        let (exit_tx, exit) = watch::channel(None);
        tokio::spawn(reap(child, pid, kill.clone(), exit_tx));

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let launches = self.inner.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.pid.store(pid.unwrap_or(0), Ordering::SeqCst);
        self.set_state(ProcessState::Running);
        tracing::info!(
            program = %resolved.program.display(),
            dir = %resolved.dir.display(),
            args = ?resolved.args,
            ?pid,
            launches,
            "Process launched"
        );

        Ok(Launch {
            generation,
            pid,
            kill,
            exit,
        })
    }

    async fn monitor(self, mut generation: u64, mut exit: watch::Receiver<Option<Termination>>) {
        loop {
            let termination = tokio::select! {
                () = self.inner.cancel.cancelled() => return,
                termination = wait_termination(&mut exit) => termination,
            };
            let Termination::Exited(status) = termination else {
                return;
            };
            if !self.mark_exited(generation, status).await {
                return;
            }

            match self.handler() {
                None => return,
                Some(OnExit::Notify(callback)) => {
                    callback(&status);
                    return;
                }
                Some(OnExit::RestartAndWatch) => match self.relaunch(generation).await {
                    Ok(Some((next, next_exit))) => {
                        generation = next;
                        exit = next_exit;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        tracing::error!(error = %e, "Automatic restart failed");
                        self.inner
                            .quit
                            .report_fatal("watcher", &e, self.inner.options.failure_policy);
                        return;
                    }
                },
            }
        }
    }

    /// Record a natural exit of `generation`. Stale generations are ignored.
    async fn mark_exited(&self, generation: u64, status: ProcessExit) -> bool {
        let mut slot = self.inner.launch.lock().await;
        if slot.as_ref().map(|l| l.generation) != Some(generation) {
            return false;
        }
        slot.take();
        self.inner.pid.store(0, Ordering::SeqCst);
        self.set_state(ProcessState::Exited);
        tracing::warn!(pid = ?status.pid, %status, "Process exited");
        self.emit(names::PROCESS_EXITED, status.to_string());
        true
    }

    /// Single restart attempt after an exit. `None` if another launch
    /// already took its place.
    async fn relaunch(
        &self,
        exited: u64,
    ) -> Result<Option<(u64, watch::Receiver<Option<Termination>>)>, LaunchError> {
        let mut slot = self.inner.launch.lock().await;
        if slot.is_some() || self.inner.generation.load(Ordering::SeqCst) != exited {
            return Ok(None);
        }
        self.set_state(ProcessState::Restarting);
        let launch = match self.launch().await {
            Ok(launch) => launch,
            Err(e) => {
                self.set_state(ProcessState::Stopped);
                return Err(e);
            }
        };
        let next = (launch.generation, launch.exit.clone());
        let payload = launch.pid.map(|p| p.to_string()).unwrap_or_default();
        self.emit(names::PROCESS_RESTARTED, payload);
        *slot = Some(launch);
        Ok(Some(next))
    }

    fn set_state(&self, next: ProcessState) {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Process state change");
        }
    }

    fn emit(&self, name: &str, payload: String) {
        if let Some(events) = &self.inner.options.events {
            events.emit(name, payload);
        }
    }

    fn lock_handler(&self) -> std::sync::MutexGuard<'_, Option<OnExit>> {
        self.inner.on_exit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<OnExit> {
        self.lock_handler().clone()
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("exec", &self.inner.spec.exec)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl ActionProvider for Watcher {
    fn actions(&self) -> ActionRegistry {
        let mut registry = ActionRegistry::new();

        let watcher = self.clone();
        registry.register(
            "restart",
            FnAction::new(move |_args: Vec<String>| {
                let watcher = watcher.clone();
                async move {
                    let pid = watcher
                        .restart()
                        .await
                        .map_err(|e| ActionError::Failed(e.to_string()))?;
                    Ok::<_, ActionError>(pid.map(|pid| format!("restarted as pid {pid}")))
                }
            }),
        );

        let watcher = self.clone();
        registry.register(
            "stop",
            FnAction::new(move |_args: Vec<String>| {
                let watcher = watcher.clone();
                async move {
                    let stopped = watcher.stop().await;
                    Ok::<_, ActionError>((!stopped).then(|| "process was not running".to_string()))
                }
            }),
        );

        registry
    }
}

/// Own the child until it ends or a kill is requested.
async fn reap(
    mut child: AsyncGroupChild,
    pid: Option<u32>,
    kill: CancellationToken,
    exit: watch::Sender<Option<Termination>>,
) {
    let termination = tokio::select! {
        status = child.wait() => {
            if let Err(e) = &status {
                tracing::warn!(?pid, error = %e, "Failed to collect exit status");
            }
            Termination::Exited(ProcessExit { pid, status: status.ok() })
        }
        () = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(?pid, error = %e, "Failed to kill process group");
            }
            if let Err(e) = child.wait().await {
                tracing::warn!(?pid, error = %e, "Failed to reap killed process");
            }
            Termination::Killed
        }
    };
    exit.send_replace(Some(termination));
}

async fn wait_termination(exit: &mut watch::Receiver<Option<Termination>>) -> Termination {
    match exit.wait_for(Option::is_some).await {
        Ok(termination) => (*termination).unwrap_or(Termination::Killed),
        // Reaper vanished without reporting.
        Err(_) => Termination::Exited(ProcessExit {
            pid: None,
            status: None,
        }),
    }
}

/// Kill a launch and wait until it is gone.
async fn terminate(launch: Launch) {
    launch.kill.cancel();
    let mut exit = launch.exit;
    let _ = exit.wait_for(Option::is_some).await;
}

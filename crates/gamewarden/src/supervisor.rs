//! Component wiring and orderly shutdown.
//!
//! Startup order: the scheduler is created first so the other components
//! can raise events into it, then the process watcher launches the server,
//! then the RCON client connects. Contributed actions are merged into the
//! scheduler before its triggers are compiled and the run-loop starts.

use std::sync::Arc;

use anyhow::{Context, Result};
use gamewarden_core::{
    ActionProvider, ActionRegistry, EventSender, QuitReason, QuitSignal, event::names,
};
use gamewarden_rcon::{Push, RconClient};
use gamewarden_scheduler::{Schedule, Scheduler};
use gamewarden_watcher::{OnExit, ProcessExit, Watcher, WatcherOptions};
use tokio::task::JoinHandle;

use crate::config::Config;

/// Components that are up, in startup order.
#[derive(Default)]
struct Running {
    watcher: Option<Watcher>,
    rcon: Option<RconClient>,
    scheduler: Option<JoinHandle<()>>,
}

/// Start every enabled component, wait for the quit signal and shut down.
///
/// A startup failure raises the quit signal itself, so whatever was
/// already started is still stopped in order.
pub async fn run(config: Config, quit: QuitSignal) -> QuitReason {
    let mut running = Running::default();
    if let Err(e) = running.start(&config, &quit).await {
        let error = format!("{e:#}");
        tracing::error!(%error, "Startup failed");
        quit.raise(QuitReason::Fatal {
            component: "startup".to_string(),
            error,
        });
    }

    let reason = quit.wait().await;
    tracing::info!(%reason, "Shutting down");
    running.shutdown().await;
    reason
}

impl Running {
    async fn start(&mut self, config: &Config, quit: &QuitSignal) -> Result<()> {
        let policy = config.supervisor.on_component_failure;

        let scheduler = if config.scheduler.enabled {
            let schedule = Schedule::load(&config.scheduler.schedule)
                .await
                .context("failed to load schedule")?;
            Some(Scheduler::new(schedule, ActionRegistry::new()))
        } else {
            None
        };
        let events = scheduler.as_ref().map(Scheduler::events);

        if config.watcher.enabled {
            let section = &config.watcher;
            let options = WatcherOptions {
                sink: section.sink(),
                events: events.clone(),
                failure_policy: policy,
            };
            let watcher = Watcher::new(section.process_spec()?, options, quit.clone());
            self.watcher = Some(watcher.clone());
            let on_exit = if section.auto_restart {
                OnExit::RestartAndWatch
            } else {
                OnExit::Notify(Arc::new(log_exit))
            };
            watcher.exec().await.context("failed to launch server process")?;
            watcher.watch(on_exit).await?;
        }

        if config.rcon.enabled {
            let client = RconClient::new(config.rcon.client_config(policy), quit.clone());
            if let Some(events) = &events {
                forward_pushes(&client, events.clone());
            }
            self.rcon = Some(client.clone());
            client.connect().await.context("failed to connect RCON")?;
            if let Some(events) = &events {
                events.emit(names::RCON_CONNECTED, config.rcon.address.clone());
            }
        }

        if let Some(mut scheduler) = scheduler {
            if let Some(watcher) = &self.watcher {
                scheduler.update_funcs(watcher.actions());
            }
            if let Some(rcon) = &self.rcon {
                scheduler.update_funcs(rcon.actions());
            }
            tracing::info!(actions = ?scheduler.registry().names(), "Action registry ready");
            scheduler.build_events().context("failed to compile schedule")?;
            self.scheduler = Some(scheduler.start(quit.token())?);
        }

        if self.watcher.is_none() && self.rcon.is_none() && self.scheduler.is_none() {
            tracing::warn!("No component enabled, waiting for interrupt");
        } else {
            tracing::info!(
                watcher = self.watcher.is_some(),
                rcon = self.rcon.is_some(),
                scheduler = self.scheduler.is_some(),
                "Supervisor started"
            );
        }
        Ok(())
    }

    async fn shutdown(self) {
        if let Some(rcon) = self.rcon {
            rcon.disconnect();
        }
        if let Some(watcher) = self.watcher {
            watcher.shutdown().await;
        }
        if let Some(scheduler) = self.scheduler {
            if let Err(e) = scheduler.await {
                tracing::error!(error = %e, "Scheduler task failed");
            }
        }
        tracing::info!("Shutdown complete");
    }
}

fn log_exit(exit: &ProcessExit) {
    tracing::warn!(
        pid = ?exit.pid,
        status = %exit,
        "Server process exited, auto-restart disabled"
    );
}

/// Turn RCON pushes into scheduler events.
fn forward_pushes(client: &RconClient, events: EventSender) {
    let chat = events.clone();
    client.attach_chat(move |push| {
        if let Push::Chat(line) = push {
            chat.emit(names::CHAT, line.clone());
        }
    });
    client.attach_events(move |push| {
        match push {
            Push::Event(line) => events.emit(names::EVENT, line.clone()),
            Push::Disconnected => events.emit(names::RCON_DISCONNECTED, ""),
            Push::Reconnected => events.emit(names::RCON_CONNECTED, ""),
            Push::Chat(_) => true,
        };
    });
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use gamewarden_core::event::Event;
    use gamewarden_rcon::{
        ClientConfig, SessionConfig,
        protocol::{PacketType, ServerPacket, decode_frame, encode_frame},
    };
    use tokio::{net::UdpSocket, time::timeout};

    use super::*;

    /// Loopback RCON endpoint that accepts any password and can be muted.
    struct LoopbackServer {
        socket: Arc<UdpSocket>,
        peer: Arc<Mutex<Option<SocketAddr>>>,
        muted: Arc<AtomicBool>,
    }

    impl LoopbackServer {
        async fn start() -> Self {
            let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
            let peer = Arc::new(Mutex::new(None));
            let muted = Arc::new(AtomicBool::new(false));
            tokio::spawn({
                let socket = Arc::clone(&socket);
                let peer = Arc::clone(&peer);
                let muted = Arc::clone(&muted);
                async move {
                    let mut buf = vec![0u8; 4096];
                    while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                        let Ok(frame) = decode_frame(&buf[..len]) else {
                            continue;
                        };
                        *peer.lock().unwrap() = Some(from);
                        let reply = match frame.kind {
                            PacketType::Login => {
                                ServerPacket::LoginReply { accepted: true }.encode()
                            }
                            PacketType::Command if !muted.load(Ordering::SeqCst) => {
                                encode_frame(PacketType::Command, &frame.body[..1])
                            }
                            _ => continue,
                        };
                        let _ = socket.send_to(&reply, from).await;
                    }
                }
            });
            Self {
                socket,
                peer,
                muted,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn push(&self, seq: u8, text: &str) {
            let peer = self.peer.lock().unwrap().expect("client connected");
            let mut body = vec![seq];
            body.extend_from_slice(text.as_bytes());
            let packet = encode_frame(PacketType::ServerMessage, &body);
            self.socket.send_to(&packet, peer).await.unwrap();
        }
    }

    async fn next_event(rx: &mut gamewarden_core::EventReceiver) -> Event {
        timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn test_nothing_enabled_waits_for_quit() {
        let quit = QuitSignal::new();
        let task = tokio::spawn(run(Config::default(), quit.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        quit.raise(QuitReason::Requested("test".into()));

        let reason = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(reason, QuitReason::Requested("test".into()));
    }

    #[tokio::test]
    async fn test_startup_failure_is_fatal() {
        let mut config = Config::default();
        config.watcher.enabled = true;
        config.watcher.exec = "no-such-game-server".into();

        let reason = timeout(Duration::from_secs(5), run(config, QuitSignal::new()))
            .await
            .unwrap();
        match reason {
            QuitReason::Fatal { component, error } => {
                assert_eq!(component, "startup");
                assert!(error.contains("failed to launch server process"), "{error}");
            }
            other => panic!("unexpected reason: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_schedule_action_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(
            &path,
            r##"{ "entries": [ { "trigger": { "event": "chat" }, "action": "exec", "args": ["#lock"] } ] }"##,
        )
        .unwrap();

        let mut config = Config::default();
        config.scheduler.enabled = true;
        config.scheduler.schedule = path;

        // `exec` comes from the RCON client, which is disabled.
        let reason = timeout(Duration::from_secs(5), run(config, QuitSignal::new()))
            .await
            .unwrap();
        assert!(reason.is_fatal());
        assert!(reason.to_string().contains("exec"), "{reason}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watcher_actions_reach_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedule.json");
        std::fs::write(
            &path,
            r#"{ "entries": [ { "trigger": { "event": "process.exited" }, "action": "restart" } ] }"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.scheduler.enabled = true;
        config.scheduler.schedule = path;
        config.watcher.enabled = true;
        config.watcher.exec = "sleep".into();
        config.watcher.params = "30".into();
        config.watcher.log_output = false;

        let quit = QuitSignal::new();
        let task = tokio::spawn(run(config, quit.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished(), "supervisor should be running");

        quit.raise(QuitReason::Requested("test".into()));
        let reason = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!reason.is_fatal());
    }

    #[tokio::test]
    async fn test_rcon_pushes_become_events() {
        let server = Arc::new(LoopbackServer::start().await);
        let mut config = ClientConfig::new(server.addr().to_string(), "pw");
        config.session = SessionConfig {
            keep_alive_timer: Duration::from_millis(50),
            keep_alive_tolerance: 3,
            login_timeout: Duration::from_millis(500),
            resend_after: Duration::from_millis(50),
            max_resends: 2,
        };
        config.reconnect_attempts = 2;
        config.reconnect_interval = Duration::from_millis(50);
        let client = RconClient::new(config, QuitSignal::new());

        let (events, mut rx) = EventSender::channel();
        forward_pushes(&client, events);
        let revive = Arc::clone(&server);
        client.attach_events(move |push| {
            if *push == Push::Disconnected {
                revive.muted.store(false, Ordering::SeqCst);
            }
        });
        client.connect().await.unwrap();

        server.push(0, "(Global) Miller: restart when?").await;
        server.push(1, "Player #1 Miller (10.0.0.1:2304) connected").await;
        assert_eq!(
            next_event(&mut rx).await,
            Event::new(names::CHAT, "(Global) Miller: restart when?")
        );
        assert_eq!(
            next_event(&mut rx).await,
            Event::new(names::EVENT, "Player #1 Miller (10.0.0.1:2304) connected")
        );

        server.muted.store(true, Ordering::SeqCst);
        assert_eq!(next_event(&mut rx).await, Event::new(names::RCON_DISCONNECTED, ""));
        assert_eq!(next_event(&mut rx).await, Event::new(names::RCON_CONNECTED, ""));

        client.disconnect();
    }
}

//! Loopback BattlEye server for integration tests.

#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use gamewarden_rcon::{
    SessionConfig,
    protocol::{PacketType, ServerPacket, decode_frame},
};
use tokio::{net::UdpSocket, task::JoinHandle};

#[derive(Default)]
struct Recorded {
    peer: Option<SocketAddr>,
    commands: Vec<String>,
    acks: Vec<u8>,
}

/// Answers logins and commands; records everything it receives.
pub struct FakeServer {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    silent: Arc<AtomicBool>,
    login_delay_ms: Arc<AtomicU64>,
    logins: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Recorded>>,
    task: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(password: &'static str) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let silent = Arc::new(AtomicBool::new(false));
        let login_delay_ms = Arc::new(AtomicU64::new(0));
        let logins = Arc::new(AtomicUsize::new(0));
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let task = tokio::spawn({
            let socket = Arc::clone(&socket);
            let silent = Arc::clone(&silent);
            let login_delay_ms = Arc::clone(&login_delay_ms);
            let logins = Arc::clone(&logins);
            let recorded = Arc::clone(&recorded);
            async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                        continue;
                    };
                    let Ok(frame) = decode_frame(&buf[..len]) else {
                        continue;
                    };
                    recorded.lock().unwrap().peer = Some(peer);
                    match frame.kind {
                        PacketType::Login => {
                            logins.fetch_add(1, Ordering::SeqCst);
                            let accepted = frame.body.as_ref() == password.as_bytes();
                            let reply = ServerPacket::LoginReply { accepted }.encode();
                            let delay = login_delay_ms.load(Ordering::SeqCst);
                            if delay == 0 {
                                let _ = socket.send_to(&reply, peer).await;
                            } else {
                                let socket = Arc::clone(&socket);
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_millis(delay)).await;
                                    let _ = socket.send_to(&reply, peer).await;
                                });
                            }
                        }
                        PacketType::Command => {
                            let seq = frame.body[0];
                            let command = String::from_utf8_lossy(&frame.body[1..]).into_owned();
                            let body = if command.is_empty() {
                                Bytes::new()
                            } else {
                                recorded.lock().unwrap().commands.push(command.clone());
                                Bytes::from(format!("ok: {command}"))
                            };
                            if silent.load(Ordering::SeqCst) {
                                continue;
                            }
                            let reply = ServerPacket::CommandReply {
                                seq,
                                part: None,
                                body,
                            }
                            .encode();
                            let _ = socket.send_to(&reply, peer).await;
                        }
                        PacketType::ServerMessage => {
                            recorded.lock().unwrap().acks.push(frame.body[0]);
                        }
                    }
                }
            }
        });

        Self {
            addr,
            socket,
            silent,
            login_delay_ms,
            logins,
            recorded,
            task,
        }
    }

    /// Stop answering commands and keep-alive probes. Logins still work.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Hold back login replies by `delay`.
    pub fn set_login_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.login_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Push a server message to the last client seen.
    pub async fn push(&self, seq: u8, text: &str) {
        let peer = self.recorded.lock().unwrap().peer.expect("no client yet");
        let packet = ServerPacket::Message {
            seq,
            body: Bytes::copy_from_slice(text.as_bytes()),
        }
        .encode();
        self.socket.send_to(&packet, peer).await.unwrap();
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.recorded.lock().unwrap().commands.clone()
    }

    pub fn acks(&self) -> Vec<u8> {
        self.recorded.lock().unwrap().acks.clone()
    }

    /// Shut the server down and release its port.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        drop(self.socket);
    }
}

/// Timers short enough for tests.
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        keep_alive_timer: Duration::from_millis(50),
        keep_alive_tolerance: 3,
        login_timeout: Duration::from_millis(300),
        resend_after: Duration::from_millis(50),
        max_resends: 2,
    }
}

/// Timers that never fire during a test.
pub fn quiet_session() -> SessionConfig {
    SessionConfig {
        keep_alive_timer: Duration::from_secs(60),
        keep_alive_tolerance: 3,
        login_timeout: Duration::from_millis(500),
        resend_after: Duration::from_secs(60),
        max_resends: 2,
    }
}

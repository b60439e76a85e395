//
// heartbeat.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use event_listener::Event;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use zeromq::ReqSocket;
use zeromq::Socket;
use zeromq::SocketRecv;
use zeromq::SocketSend;

use crate::error::KMError;
use crate::locks::lock;
use jkshared::jupyter_message::JupyterChannel;

const HB_PAYLOAD: &str = "ping";

/// How long to back off after the socket reports an error mid-wait
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// How often to ping the kernel and how long to wait for each pong.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTiming {
    pub period: Duration,
    pub time_to_dead: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            time_to_dead: Duration::from_secs(1),
        }
    }
}

/// A liveness probe for a kernel.
///
/// `is_alive` means the monitor is running; `is_beating` means the kernel
/// has answered every ping in time. Once a ping goes unanswered the monitor
/// stops pinging and `is_beating` stays false until a new monitor is started.
#[async_trait]
pub trait Heartbeat: Send + Sync {
    fn start(&self);
    async fn stop(&self);
    fn is_alive(&self) -> bool;
    fn is_beating(&self) -> bool;
}

enum PingOutcome {
    Pong,
    Missed,
    Stopped,
}

struct HeartbeatState {
    session_id: String,
    timing: HeartbeatTiming,
    socket: Mutex<Option<ReqSocket>>,
    alive: AtomicBool,
    beating: AtomicBool,
    exit_event: Event,
}

/// Pings the kernel's heartbeat socket from a background task.
pub struct HeartbeatChannel {
    state: Arc<HeartbeatState>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatChannel {
    /// Connect to the heartbeat socket at `address`. The monitor does not
    /// ping until it is started. Like the message channels, this waits until
    /// the kernel is listening; `ZmqChannelFactory` puts a bound on it.
    pub async fn connect(
        address: &str,
        session_id: &str,
        timing: HeartbeatTiming,
    ) -> Result<Self, KMError> {
        let mut hb_socket = ReqSocket::new();
        if let Err(err) = hb_socket.connect(address).await {
            log::error!(
                "[session {}] Failed to connect to heartbeat socket: {}.",
                session_id,
                err
            );
            return Err(KMError::Transport(JupyterChannel::Heartbeat, err));
        }
        log::debug!(
            "[session {}] Connected to heartbeat socket at {}.",
            session_id,
            address
        );
        Ok(Self {
            state: Arc::new(HeartbeatState {
                session_id: session_id.to_string(),
                timing,
                socket: Mutex::new(Some(hb_socket)),
                alive: AtomicBool::new(false),
                beating: AtomicBool::new(false),
                exit_event: Event::new(),
            }),
            task: std::sync::Mutex::new(None),
        })
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        lock(&self.task).take()
    }
}

impl HeartbeatState {
    async fn run(self: Arc<Self>) {
        loop {
            match self.ping().await {
                PingOutcome::Pong => {}
                PingOutcome::Stopped => return,
                PingOutcome::Missed => {
                    self.beating.store(false, Ordering::SeqCst);
                    log::warn!(
                        "[session {}] No heartbeat from kernel within {:?}; considering it dead.",
                        self.session_id,
                        self.timing.time_to_dead
                    );
                    return;
                }
            }

            let exit_listener = self.exit_event.listen();
            if !self.alive.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = exit_listener => return,
                _ = tokio::time::sleep(self.timing.period) => {}
            }
        }
    }

    /// Send one ping and wait for the matching pong.
    async fn ping(&self) -> PingOutcome {
        let mut socket = self.socket.lock().await;
        let Some(hb_socket) = socket.as_mut() else {
            return PingOutcome::Stopped;
        };

        let deadline = Instant::now() + self.timing.time_to_dead;
        log::trace!("[session {}] Sending heartbeat to kernel.", self.session_id);
        if let Err(err) = hb_socket.send(HB_PAYLOAD.into()).await {
            log::debug!(
                "[session {}] Failed to send heartbeat: {}",
                self.session_id,
                err
            );
        }

        loop {
            let now = Instant::now();
            if now >= deadline {
                return PingOutcome::Missed;
            }
            let exit_listener = self.exit_event.listen();
            if !self.alive.load(Ordering::SeqCst) {
                return PingOutcome::Stopped;
            }
            tokio::select! {
                _ = exit_listener => return PingOutcome::Stopped,
                result = timeout(deadline - now, hb_socket.recv()) => {
                    match result {
                        Ok(Ok(reply)) => {
                            if is_pong(reply) {
                                return PingOutcome::Pong;
                            }
                            // Ask again; a REQ socket gets one reply per request
                            log::trace!(
                                "[session {}] Ignoring unexpected heartbeat reply.",
                                self.session_id
                            );
                            if let Err(err) = hb_socket.send(HB_PAYLOAD.into()).await {
                                log::debug!(
                                    "[session {}] Failed to resend heartbeat: {}",
                                    self.session_id,
                                    err
                                );
                            }
                        }
                        Ok(Err(err)) => {
                            log::debug!(
                                "[session {}] Error waiting for heartbeat: {}",
                                self.session_id,
                                err
                            );
                            tokio::time::sleep(ERROR_BACKOFF.min(deadline - now)).await;
                        }
                        Err(_) => return PingOutcome::Missed,
                    }
                }
            }
        }
    }
}

fn is_pong(reply: zeromq::ZmqMessage) -> bool {
    let frames = reply.into_vec();
    frames.len() == 1 && frames[0].as_ref() == HB_PAYLOAD.as_bytes()
}

#[async_trait]
impl Heartbeat for HeartbeatChannel {
    fn start(&self) {
        if self.state.alive.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.beating.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(self.state.clone().run());
        *lock(&self.task) = Some(handle);
    }

    async fn stop(&self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.exit_event.notify(usize::MAX);

        if let Some(task) = self.take_task() {
            if let Err(err) = task.await {
                log::debug!(
                    "[session {}] Heartbeat task ended abnormally: {}",
                    self.state.session_id,
                    err
                );
            }
        }

        let socket = self.state.socket.lock().await.take();
        if let Some(hb_socket) = socket {
            hb_socket.close().await;
            log::debug!(
                "[session {}] Stopped heartbeat monitor.",
                self.state.session_id
            );
        }
    }

    fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn is_beating(&self) -> bool {
        self.state.beating.load(Ordering::SeqCst)
    }
}

impl Drop for HeartbeatChannel {
    fn drop(&mut self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.exit_event.notify(usize::MAX);
    }
}

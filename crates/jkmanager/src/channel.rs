//
// channel.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Message channels to a kernel (shell, iopub, stdin and control) and the
//! factory that opens them.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jkshared::connection_info::ConnectionInfo;
use jkshared::jupyter_message::{JupyterChannel, JupyterMessage};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use zeromq::{
    util::PeerIdentity, DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, SubSocket,
    ZmqMessage,
};

use crate::error::KMError;
use crate::heartbeat::{Heartbeat, HeartbeatChannel, HeartbeatTiming};
use crate::session::{Session, Signer};
use crate::wire_message::WireMessage;

/// How long a blocking `receive` waits between checks of the alive flag
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// How long the factory waits for a kernel socket to accept a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A single conduit for Jupyter messages to and from the kernel.
///
/// A channel must be started before it sends or receives anything. Once
/// stopped, `send` and `try_receive` quietly do nothing, so a loop that is
/// polling a channel while it is being stopped sees an empty result and can
/// exit on its own.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Which of the kernel's sockets this channel talks to
    fn kind(&self) -> JupyterChannel;

    fn start(&self);

    /// Stop the channel and release its socket. Safe to call more than once,
    /// and safe to call on a channel that was never started.
    async fn stop(&self);

    fn is_alive(&self) -> bool;

    /// Sign and send a message. Returns `Ok(false)` if the channel is not
    /// alive and the message was dropped.
    async fn send(&self, msg: &JupyterMessage) -> Result<bool, KMError>;

    /// Wait up to `wait` for a message. Returns `Ok(None)` on timeout or if
    /// the channel is not alive.
    async fn try_receive(&self, wait: Duration) -> Result<Option<JupyterMessage>, KMError>;

    /// Wait for a message for as long as the channel is alive.
    async fn receive(&self) -> Result<Option<JupyterMessage>, KMError> {
        while self.is_alive() {
            if let Some(msg) = self.try_receive(RECEIVE_SLICE).await? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}

/// Opens channels to a kernel.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create_channel(&self, kind: JupyterChannel) -> Result<Arc<dyn Channel>, KMError>;

    async fn create_heartbeat(&self) -> Result<Arc<dyn Heartbeat>, KMError>;
}

enum ChannelSocket {
    Dealer(DealerSocket),
    Sub(SubSocket),
}

impl ChannelSocket {
    async fn send(&mut self, kind: JupyterChannel, msg: ZmqMessage) -> Result<(), KMError> {
        match self {
            ChannelSocket::Dealer(socket) => socket
                .send(msg)
                .await
                .map_err(|err| KMError::Transport(kind, err)),
            ChannelSocket::Sub(_) => Err(KMError::ProtocolViolation(format!(
                "cannot send on the {} channel; it only receives",
                kind
            ))),
        }
    }

    async fn recv(&mut self) -> Result<ZmqMessage, zeromq::ZmqError> {
        match self {
            ChannelSocket::Dealer(socket) => socket.recv().await,
            ChannelSocket::Sub(socket) => socket.recv().await,
        }
    }

    async fn close(self) {
        match self {
            ChannelSocket::Dealer(socket) => {
                socket.close().await;
            }
            ChannelSocket::Sub(socket) => {
                socket.close().await;
            }
        }
    }
}

/// A channel backed by a ZeroMQ socket.
pub struct ZmqChannel {
    kind: JupyterChannel,
    session_id: String,
    signer: Signer,
    socket: Mutex<Option<ChannelSocket>>,
    alive: AtomicBool,
}

impl ZmqChannel {
    /// Connect a socket of the right type for `kind` to `endpoint`.
    ///
    /// ZeroMQ keeps retrying until something is listening at `endpoint`, so
    /// this only returns once the kernel has bound the port. Callers that
    /// cannot wait forever go through `ZmqChannelFactory`, which bounds it.
    pub async fn connect(
        kind: JupyterChannel,
        endpoint: &str,
        session_id: &str,
        signer: Signer,
    ) -> Result<Self, KMError> {
        let socket = match kind {
            JupyterChannel::Shell | JupyterChannel::Stdin | JupyterChannel::Control => {
                let mut socket = DealerSocket::with_options(dealer_peer_opts(session_id));
                socket
                    .connect(endpoint)
                    .await
                    .map_err(|err| KMError::Transport(kind, err))?;
                ChannelSocket::Dealer(socket)
            }
            JupyterChannel::IOPub => {
                let mut socket = SubSocket::new();
                socket
                    .connect(endpoint)
                    .await
                    .map_err(|err| KMError::Transport(kind, err))?;
                socket
                    .subscribe("")
                    .await
                    .map_err(|err| KMError::Transport(kind, err))?;
                ChannelSocket::Sub(socket)
            }
            JupyterChannel::Heartbeat => {
                return Err(KMError::Config(String::from(
                    "the heartbeat is not a message channel",
                )))
            }
        };
        log::debug!(
            "[session {}] Connected to {} channel at {}",
            session_id,
            kind,
            endpoint
        );
        Ok(Self {
            kind,
            session_id: session_id.to_string(),
            signer,
            socket: Mutex::new(Some(socket)),
            alive: AtomicBool::new(false),
        })
    }
}

/// Dealer sockets identify themselves with the session ID so the kernel can
/// route stdin requests to the same client as the shell request.
fn dealer_peer_opts(session_id: &str) -> SocketOptions {
    let mut peer_opts = SocketOptions::default();
    match PeerIdentity::from_str(session_id) {
        Ok(peer_id) => {
            peer_opts.peer_identity(peer_id);
        }
        Err(err) => {
            log::warn!(
                "[session {}] Cannot use session ID as socket identity: {}",
                session_id,
                err
            );
        }
    }
    peer_opts
}

#[async_trait]
impl Channel for ZmqChannel {
    fn kind(&self) -> JupyterChannel {
        self.kind
    }

    fn start(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let socket = self.socket.lock().await.take();
        if let Some(socket) = socket {
            socket.close().await;
            log::debug!(
                "[session {}] Closed {} channel",
                self.session_id,
                self.kind
            );
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: &JupyterMessage) -> Result<bool, KMError> {
        if !self.is_alive() {
            return Ok(false);
        }
        let wire = WireMessage::from_jupyter(msg, &self.signer)?;
        let zmq_msg = ZmqMessage::try_from(wire)?;

        let mut socket = self.socket.lock().await;
        let Some(socket) = socket.as_mut() else {
            return Ok(false);
        };
        socket.send(self.kind, zmq_msg).await?;
        log::trace!(
            "[session {}] Sent '{}' ({}) on {}",
            self.session_id,
            msg.msg_type(),
            msg.msg_id(),
            self.kind
        );
        Ok(true)
    }

    async fn try_receive(&self, wait: Duration) -> Result<Option<JupyterMessage>, KMError> {
        if !self.is_alive() {
            return Ok(None);
        }
        let received = {
            let mut socket = self.socket.lock().await;
            let Some(socket) = socket.as_mut() else {
                return Ok(None);
            };
            match timeout(wait, socket.recv()).await {
                Err(_) => return Ok(None),
                Ok(result) => result.map_err(|err| KMError::Transport(self.kind, err))?,
            }
        };

        let msg = WireMessage::from(received).to_jupyter(&self.signer)?;
        log::trace!(
            "[session {}] Received '{}' on {}",
            self.session_id,
            msg.msg_type(),
            self.kind
        );
        Ok(Some(msg))
    }
}

/// Opens ZeroMQ channels against the ports in a connection file.
pub struct ZmqChannelFactory {
    connection: ConnectionInfo,
    session_id: String,
    signer: Signer,
    heartbeat_timing: HeartbeatTiming,
    connect_timeout: Duration,
}

impl ZmqChannelFactory {
    pub fn new(connection: ConnectionInfo, session: &Session) -> Self {
        Self {
            connection,
            session_id: session.session_id(),
            signer: session.signer(),
            heartbeat_timing: HeartbeatTiming::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// How long to wait for each socket to connect before giving up.
    pub fn with_connect_timeout(mut self, wait: Duration) -> Self {
        self.connect_timeout = wait;
        self
    }

    pub fn with_heartbeat_timing(mut self, timing: HeartbeatTiming) -> Self {
        self.heartbeat_timing = timing;
        self
    }

    fn port(&self, kind: JupyterChannel) -> u16 {
        match kind {
            JupyterChannel::Shell => self.connection.shell_port,
            JupyterChannel::Control => self.connection.control_port,
            JupyterChannel::Stdin => self.connection.stdin_port,
            JupyterChannel::IOPub => self.connection.iopub_port,
            JupyterChannel::Heartbeat => self.connection.hb_port,
        }
    }

    fn timed_out(&self, kind: JupyterChannel, endpoint: &str) -> KMError {
        log::warn!(
            "[session {}] Nothing listening for the {} channel at {} after {:?}",
            self.session_id,
            kind,
            endpoint,
            self.connect_timeout
        );
        KMError::ConnectTimeout(kind, self.connect_timeout)
    }
}

#[async_trait]
impl ChannelFactory for ZmqChannelFactory {
    async fn create_channel(&self, kind: JupyterChannel) -> Result<Arc<dyn Channel>, KMError> {
        let endpoint = self.connection.endpoint(self.port(kind));
        let connect = ZmqChannel::connect(kind, &endpoint, &self.session_id, self.signer.clone());
        match timeout(self.connect_timeout, connect).await {
            Ok(channel) => Ok(Arc::new(channel?)),
            Err(_) => Err(self.timed_out(kind, &endpoint)),
        }
    }

    async fn create_heartbeat(&self) -> Result<Arc<dyn Heartbeat>, KMError> {
        let endpoint = self.connection.endpoint(self.port(JupyterChannel::Heartbeat));
        let connect = HeartbeatChannel::connect(&endpoint, &self.session_id, self.heartbeat_timing);
        match timeout(self.connect_timeout, connect).await {
            Ok(heartbeat) => Ok(Arc::new(heartbeat?)),
            Err(_) => Err(self.timed_out(JupyterChannel::Heartbeat, &endpoint)),
        }
    }
}

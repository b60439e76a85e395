//
// mod.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! In-memory channels for exercising the kernel client and manager without a
//! kernel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jkmanager::channel::{Channel, ChannelFactory};
use jkmanager::error::KMError;
use jkmanager::heartbeat::Heartbeat;
use jkmanager::kernel_client::KernelLiveness;
use jkmanager::session::Session;
use jkshared::jupyter_message::{JupyterChannel, JupyterMessage};
use serde_json::Value;

type Responder = Box<dyn Fn(&JupyterMessage) -> Option<JupyterMessage> + Send + Sync>;

enum Inbound {
    Message(JupyterMessage),
    Failure,
}

/// A channel whose inbound messages are queued by the test.
pub struct MockChannel {
    kind: JupyterChannel,
    alive: AtomicBool,
    inbound_tx: async_channel::Sender<Inbound>,
    inbound_rx: async_channel::Receiver<Inbound>,
    sent: Mutex<Vec<JupyterMessage>>,
    responder: Mutex<Option<Responder>>,
}

impl MockChannel {
    pub fn new(kind: JupyterChannel) -> Self {
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        Self {
            kind,
            alive: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    /// Queue a message for the channel's reader.
    pub fn push(&self, msg: JupyterMessage) {
        self.inbound_tx
            .try_send(Inbound::Message(msg))
            .expect("mock channel queue is closed");
    }

    /// Make the next receive fail as if the socket had broken.
    pub fn fail(&self) {
        self.inbound_tx
            .try_send(Inbound::Failure)
            .expect("mock channel queue is closed");
    }

    /// Answer every sent message for which `responder` returns a reply.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&JupyterMessage) -> Option<JupyterMessage> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn sent(&self) -> Vec<JupyterMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_of_type(&self, msg_type: &str) -> Vec<JupyterMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.header.msg_type == msg_type)
            .collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn kind(&self) -> JupyterChannel {
        self.kind
    }

    fn start(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, msg: &JupyterMessage) -> Result<bool, KMError> {
        if !self.is_alive() {
            return Ok(false);
        }
        self.sent.lock().unwrap().push(msg.clone());
        let reply = match self.responder.lock().unwrap().as_ref() {
            Some(responder) => responder(msg),
            None => None,
        };
        if let Some(reply) = reply {
            self.push(reply);
        }
        Ok(true)
    }

    async fn try_receive(&self, wait: Duration) -> Result<Option<JupyterMessage>, KMError> {
        if !self.is_alive() {
            return Ok(None);
        }
        match tokio::time::timeout(wait, self.inbound_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(_)) => Ok(None),
            Ok(Ok(Inbound::Message(msg))) => Ok(Some(msg)),
            Ok(Ok(Inbound::Failure)) => Err(KMError::ProtocolViolation(String::from(
                "simulated transport failure",
            ))),
        }
    }
}

/// A heartbeat whose beating flag is set by the test.
pub struct MockHeartbeat {
    alive: AtomicBool,
    beating: AtomicBool,
}

impl MockHeartbeat {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(false),
            beating: AtomicBool::new(false),
        }
    }

    pub fn set_beating(&self, beating: bool) {
        self.beating.store(beating, Ordering::SeqCst);
    }
}

#[async_trait]
impl Heartbeat for MockHeartbeat {
    fn start(&self) {
        self.alive.store(true, Ordering::SeqCst);
        self.beating.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_beating(&self) -> bool {
        self.beating.load(Ordering::SeqCst)
    }
}

/// Hands out one `MockChannel` per channel kind, creating it on first use.
pub struct MockChannelFactory {
    channels: Mutex<HashMap<JupyterChannel, Arc<MockChannel>>>,
    heartbeat: Arc<MockHeartbeat>,
    created: AtomicUsize,
}

impl MockChannelFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            heartbeat: Arc::new(MockHeartbeat::new()),
            created: AtomicUsize::new(0),
        })
    }

    /// The mock for `kind`, created if the code under test hasn't asked for
    /// it yet.
    pub fn channel(&self, kind: JupyterChannel) -> Arc<MockChannel> {
        self.channels
            .lock()
            .unwrap()
            .entry(kind)
            .or_insert_with(|| Arc::new(MockChannel::new(kind)))
            .clone()
    }

    pub fn heartbeat(&self) -> Arc<MockHeartbeat> {
        self.heartbeat.clone()
    }

    /// How many times a channel was requested from the factory.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn create_channel(&self, kind: JupyterChannel) -> Result<Arc<dyn Channel>, KMError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.channel(kind))
    }

    async fn create_heartbeat(&self) -> Result<Arc<dyn Heartbeat>, KMError> {
        Ok(self.heartbeat.clone())
    }
}

/// A kernel owner whose liveness is set by the test.
pub struct FakeOwner(pub AtomicBool);

impl FakeOwner {
    pub fn new(alive: bool) -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(alive)))
    }

    pub fn set_alive(&self, alive: bool) {
        self.0.store(alive, Ordering::SeqCst);
    }
}

impl KernelLiveness for FakeOwner {
    fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Build a message from the "kernel" replying to `parent`.
pub fn kernel_reply(parent: &JupyterMessage, msg_type: &str, content: Value) -> JupyterMessage {
    let kernel = Session::new(b"");
    kernel.new_message(msg_type, content).reply_to(parent)
}

/// Build a message from the "kernel" that isn't a reply to anything.
pub fn kernel_message(msg_type: &str, content: Value) -> JupyterMessage {
    let kernel = Session::new(b"");
    kernel.new_message(msg_type, content)
}

/// Poll `done` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, done: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

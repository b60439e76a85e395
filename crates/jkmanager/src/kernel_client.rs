//
// kernel_client.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! A client for a running kernel: opens the shell, iopub and stdin channels
//! plus the heartbeat, polls each channel from its own task, and tracks the
//! state of every execute request it sends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use event_listener::Event;
use jkshared::connection_info::ConnectionInfo;
use jkshared::jupyter_message::{msg_type, JupyterChannel, JupyterMessage};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::channel::{Channel, ChannelFactory, ZmqChannelFactory};
use crate::connection_file::ConnectionFile;
use crate::error::KMError;
use crate::execution_log::{ExecutionEntry, ExecutionLog};
use crate::heartbeat::Heartbeat;
use crate::jupyter_messages::{JupyterExecuteRequest, JupyterMsg};
use crate::locks::lock;
use crate::session::Session;

/// How long each channel loop waits for a message before checking whether it
/// should keep running
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How often the wait helpers check the state they are waiting on
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Something that knows whether the kernel process is still running.
pub trait KernelLiveness: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// Which channels `start_channels` should start.
#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    pub shell: bool,
    pub iopub: bool,
    pub stdin: bool,
    pub heartbeat: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            shell: true,
            iopub: true,
            stdin: true,
            heartbeat: true,
        }
    }
}

struct ClientInner {
    session: Session,
    factory: Arc<dyn ChannelFactory>,

    /// The supervisor of the kernel process, if this client has one
    owner: Option<Arc<dyn KernelLiveness>>,

    channels: Mutex<HashMap<JupyterChannel, Arc<dyn Channel>>>,
    heartbeat: Mutex<Option<Arc<dyn Heartbeat>>>,

    /// Guarded separately from the channels; never held across an await
    execute_log: Mutex<ExecutionLog>,

    loops: Mutex<Vec<JoinHandle<()>>>,
    exit_event: Event,
    stopping: AtomicBool,
    kernel_connected: AtomicBool,
    allow_stdin: AtomicBool,
}

/// A client connection to a kernel.
pub struct KernelClient {
    inner: Arc<ClientInner>,
}

impl KernelClient {
    /// Create a client that connects to the kernel described by
    /// `connection` over ZeroMQ. Channels are not opened until
    /// `start_channels` is called.
    pub fn new(connection: &ConnectionInfo, owner: Option<Arc<dyn KernelLiveness>>) -> Self {
        let session = Session::new(connection.key_bytes());
        let factory = Arc::new(ZmqChannelFactory::new(connection.clone(), &session));
        Self::with_factory(session, factory, owner)
    }

    /// Create a client that opens its channels through `factory`.
    pub fn with_factory(
        session: Session,
        factory: Arc<dyn ChannelFactory>,
        owner: Option<Arc<dyn KernelLiveness>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                session,
                factory,
                owner,
                channels: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
                execute_log: Mutex::new(ExecutionLog::new()),
                loops: Mutex::new(Vec::new()),
                exit_event: Event::new(),
                stopping: AtomicBool::new(false),
                kernel_connected: AtomicBool::new(false),
                allow_stdin: AtomicBool::new(false),
            }),
        }
    }

    /// Create a client for a kernel someone else launched, from its
    /// connection file.
    pub fn from_connection_file<P: AsRef<Path>>(path: P) -> Result<Self, KMError> {
        let connection_file = ConnectionFile::from_file(path)?;
        Ok(Self::new(&connection_file.info, None))
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Open and start the selected channels, one polling task per message
    /// channel, then ask the kernel for its info so that it publishes on
    /// iopub.
    pub async fn start_channels(&self, options: StartOptions) -> Result<(), KMError> {
        self.inner.stopping.store(false, Ordering::SeqCst);

        let selected = [
            (options.shell, JupyterChannel::Shell),
            (options.iopub, JupyterChannel::IOPub),
            (options.stdin, JupyterChannel::Stdin),
        ];
        for (enabled, kind) in selected {
            if !enabled {
                continue;
            }
            let channel = self.inner.channel(kind).await?;
            if channel.is_alive() {
                continue;
            }
            channel.start();
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { inner.run_channel_loop(channel).await });
            lock(&self.inner.loops).push(handle);
        }
        self.inner.allow_stdin.store(options.stdin, Ordering::SeqCst);

        if options.heartbeat {
            let heartbeat = self.inner.heartbeat().await?;
            heartbeat.start();
        }

        if options.shell {
            self.kernel_info().await?;
        }
        Ok(())
    }

    /// Stop every channel and the heartbeat, then wait for the polling tasks
    /// to finish. Calling this more than once is harmless.
    pub async fn stop_channels(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::SeqCst);
        inner.exit_event.notify(usize::MAX);

        let channels: Vec<Arc<dyn Channel>> =
            lock(&inner.channels).drain().map(|(_, c)| c).collect();
        for channel in &channels {
            channel.stop().await;
        }

        let heartbeat = lock(&inner.heartbeat).take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        let loops: Vec<JoinHandle<()>> = lock(&inner.loops).drain(..).collect();
        for handle in loops {
            if let Err(err) = handle.await {
                log::warn!(
                    "[session {}] Channel loop ended abnormally: {}",
                    inner.session.session_id(),
                    err
                );
            }
        }
    }

    /// Whether any channel or the heartbeat is running.
    pub fn channels_running(&self) -> bool {
        let channels = lock(&self.inner.channels)
            .values()
            .any(|channel| channel.is_alive());
        let heartbeat = lock(&self.inner.heartbeat)
            .as_ref()
            .is_some_and(|hb| hb.is_alive());
        channels || heartbeat
    }

    /// Whether the kernel is believed to be running.
    pub fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    /// Whether anything has arrived on iopub yet.
    pub fn is_kernel_connected(&self) -> bool {
        self.inner.kernel_connected.load(Ordering::SeqCst)
    }

    /// Whether the stdin channel was started.
    pub fn allow_stdin(&self) -> bool {
        self.inner.allow_stdin.load(Ordering::SeqCst)
    }

    /// Ask the kernel to run `code`. Returns the ID of the request, which
    /// is tracked in the execution log from before it is sent.
    pub async fn execute(&self, code: &str) -> Result<String, KMError> {
        let content = serde_json::to_value(JupyterExecuteRequest::new(code))?;
        let request = self
            .inner
            .session
            .new_message(msg_type::EXECUTE_REQUEST, content);
        let msg_id = request.header.msg_id.clone();

        lock(&self.inner.execute_log).insert(request.clone());

        let sent = match self.inner.channel(JupyterChannel::Shell).await {
            Ok(shell) => shell.send(&request).await,
            Err(err) => Err(err),
        };
        match sent {
            Ok(true) => {
                log::debug!(
                    "[session {}] Sent execute request {}",
                    self.inner.session.session_id(),
                    msg_id
                );
                Ok(msg_id)
            }
            Ok(false) => {
                lock(&self.inner.execute_log).abandon(&msg_id);
                Err(KMError::ChannelNotAlive(JupyterChannel::Shell))
            }
            Err(err) => {
                lock(&self.inner.execute_log).abandon(&msg_id);
                Err(err)
            }
        }
    }

    /// Send a `kernel_info_request` on the shell channel. Returns the
    /// request's message ID.
    pub async fn kernel_info(&self) -> Result<String, KMError> {
        let request = self.inner.session.new_message(
            msg_type::KERNEL_INFO_REQUEST,
            serde_json::Value::Object(serde_json::Map::new()),
        );
        let shell = self.inner.channel(JupyterChannel::Shell).await?;
        if !shell.send(&request).await? {
            return Err(KMError::ChannelNotAlive(JupyterChannel::Shell));
        }
        Ok(request.header.msg_id)
    }

    pub fn has_pending_execute(&self) -> bool {
        lock(&self.inner.execute_log).has_pending()
    }

    pub fn pending_execute_count(&self) -> usize {
        lock(&self.inner.execute_log).pending_count()
    }

    pub fn has_execute_error(&self) -> bool {
        lock(&self.inner.execute_log).has_error()
    }

    /// Everything that went wrong across all execute requests.
    pub fn execute_errors(&self) -> Vec<String> {
        lock(&self.inner.execute_log).errors()
    }

    /// A copy of the state of a single execute request.
    pub fn execution_entry(&self, msg_id: &str) -> Option<ExecutionEntry> {
        lock(&self.inner.execute_log).get(msg_id).cloned()
    }

    /// A copy of every tracked execute request, oldest first.
    pub fn execute_log(&self) -> Vec<ExecutionEntry> {
        lock(&self.inner.execute_log).entries().to_vec()
    }

    /// Forget every execute request, including pending ones.
    pub fn clear_execute_log(&self) {
        lock(&self.inner.execute_log).clear();
    }

    /// Wait until the kernel has published something on iopub. Returns false
    /// if `timeout` elapses first.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.is_kernel_connected()).await
    }

    /// Wait until no execute request is pending. Returns false if `timeout`
    /// elapses first.
    pub async fn wait_for_pending(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || !self.has_pending_execute()).await
    }

    async fn wait_until<F: Fn() -> bool>(&self, timeout: Duration, done: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
    }
}

impl Drop for KernelClient {
    fn drop(&mut self) {
        // Let the polling tasks wind down on their own
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.exit_event.notify(usize::MAX);
    }
}

impl ClientInner {
    fn is_alive(&self) -> bool {
        if let Some(owner) = &self.owner {
            return owner.is_alive();
        }
        let heartbeat = lock(&self.heartbeat).clone();
        match heartbeat {
            // Until the heartbeat is running it has nothing to say
            Some(heartbeat) if heartbeat.is_alive() => heartbeat.is_beating(),
            _ => true,
        }
    }

    /// Get a channel, opening it if this client doesn't have one yet.
    async fn channel(&self, kind: JupyterChannel) -> Result<Arc<dyn Channel>, KMError> {
        let existing = lock(&self.channels).get(&kind).cloned();
        if let Some(channel) = existing {
            return Ok(channel);
        }
        let created = self.factory.create_channel(kind).await?;
        let mut channels = lock(&self.channels);
        Ok(channels.entry(kind).or_insert(created).clone())
    }

    async fn heartbeat(&self) -> Result<Arc<dyn Heartbeat>, KMError> {
        let existing = lock(&self.heartbeat).clone();
        if let Some(heartbeat) = existing {
            return Ok(heartbeat);
        }
        let created = self.factory.create_heartbeat().await?;
        let mut heartbeat = lock(&self.heartbeat);
        Ok(heartbeat.get_or_insert(created).clone())
    }

    async fn run_channel_loop(self: Arc<Self>, channel: Arc<dyn Channel>) {
        let kind = channel.kind();
        log::debug!(
            "[session {}] Polling the {} channel",
            self.session.session_id(),
            kind
        );

        if let Err(err) = self.poll_channel(&channel).await {
            log::error!(
                "[session {}] Stopped polling the {} channel: {}",
                self.session.session_id(),
                kind,
                err
            );
        }

        // Nothing more will arrive on this channel
        let abandoned = lock(&self.execute_log).abandon_pending();
        if abandoned > 0 {
            log::warn!(
                "[session {}] Abandoned {} pending execute request{} when the {} channel loop exited",
                self.session.session_id(),
                abandoned,
                if abandoned == 1 { "" } else { "s" },
                kind
            );
        }
    }

    async fn poll_channel(&self, channel: &Arc<dyn Channel>) -> Result<(), KMError> {
        loop {
            let exit_listener = self.exit_event.listen();
            if self.stopping.load(Ordering::SeqCst) || !channel.is_alive() || !self.is_alive() {
                return Ok(());
            }
            let received = tokio::select! {
                _ = exit_listener => return Ok(()),
                received = channel.try_receive(POLL_TIMEOUT) => received?,
            };
            if let Some(msg) = received {
                self.handle_message(channel.kind(), msg);
            }
        }
    }

    /// Match a message from the kernel against the execution log.
    fn handle_message(&self, kind: JupyterChannel, msg: JupyterMessage) {
        if kind == JupyterChannel::IOPub && !self.kernel_connected.swap(true, Ordering::SeqCst) {
            log::info!(
                "[session {}] Kernel connected (first message on iopub).",
                self.session.session_id()
            );
        }
        if self.session.adopt_session_id(&msg.header.session) {
            log::debug!(
                "[session {}] Adopted session ID from the kernel.",
                msg.header.session
            );
        }

        let classified = JupyterMsg::from(&msg);
        let Some(parent_id) = msg.parent_id().map(str::to_string) else {
            if matches!(classified, JupyterMsg::ExecuteReply(_)) {
                log::debug!(
                    "[session {}] Dropping '{}' with no parent header.",
                    self.session.session_id(),
                    msg.msg_type()
                );
            }
            return;
        };

        let tracked = match classified {
            JupyterMsg::ExecuteReply(reply) => lock(&self.execute_log).record_reply(
                &parent_id,
                msg,
                reply.status(),
                reply.execution_count,
            ),
            JupyterMsg::Data => lock(&self.execute_log).record_output(&parent_id, msg),
            JupyterMsg::Status(status) => {
                log::trace!(
                    "[session {}] Kernel is {:?} ({}).",
                    self.session.session_id(),
                    status.execution_state,
                    parent_id
                );
                return;
            }
            JupyterMsg::ShutdownReply(_) | JupyterMsg::Other => return,
        };
        if !tracked {
            log::trace!(
                "[session {}] Ignoring reply to untracked request {}.",
                self.session.session_id(),
                parent_id
            );
        }
    }
}

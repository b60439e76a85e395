//
// mod.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Launching and supervising a kernel process.

pub mod environment;
pub mod lifecycle;
pub mod process;
pub mod startup;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jkshared::connection_info::{ConnectionInfo, TCP_TRANSPORT};
use jkshared::jupyter_message::JupyterChannel;
use jkshared::kernel_spec::KernelSpec;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::channel::{Channel, ChannelFactory, ZmqChannelFactory, DEFAULT_CONNECT_TIMEOUT};
use crate::connection_file::ConnectionFile;
use crate::error::KMError;
use crate::kernel_client::{KernelClient, KernelLiveness, StartOptions};
use crate::kernel_spec_manager::KernelSpecProvider;
use crate::session::Session;

use environment::EnvironmentResolver;
use lifecycle::ControlState;
use process::{KernelProcess, KernelProcessSlot};

/// How long to wait for a killed kernel to go away
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Settings for launching a kernel.
#[derive(Debug, Clone)]
pub struct KernelManagerOptions {
    /// The address the kernel listens on; must be local
    pub ip: String,

    pub transport: String,

    /// Where to write the connection file; a fresh temporary file if unset
    pub connection_file: Option<PathBuf>,

    /// Extra environment variables for the kernel. Inherited variables and
    /// the kernel spec's own `env` take precedence.
    pub env: HashMap<String, String>,

    /// How long to give the kernel to open its sockets after launch
    pub launch_settle_time: Duration,

    /// How long to wait for each of the kernel's sockets to accept a
    /// connection
    pub connect_timeout: Duration,

    /// How long to wait for the kernel to acknowledge a shutdown request
    pub shutdown_wait: Duration,

    pub shutdown_poll_interval: Duration,
}

impl Default for KernelManagerOptions {
    fn default() -> Self {
        Self {
            ip: String::from("127.0.0.1"),
            transport: String::from(TCP_TRANSPORT),
            connection_file: None,
            env: HashMap::new(),
            launch_settle_time: Duration::from_millis(500),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            shutdown_wait: Duration::from_secs(5),
            shutdown_poll_interval: Duration::from_millis(100),
        }
    }
}

/// How a kernel shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The kernel replied to the shutdown request
    Acknowledged,

    /// The kernel did not reply in time and was killed
    Killed,

    /// The kernel process had already exited
    AlreadyExited,

    /// No kernel was running
    NotRunning,
}

/// Launches a kernel process and supervises it: owns the process, the
/// connection file and the control channel.
pub struct KernelManager {
    kernel_name: String,
    spec: KernelSpec,
    options: KernelManagerOptions,
    connection_file: ConnectionFile,

    /// Opens channels instead of ZeroMQ when set
    channel_factory: Option<Arc<dyn ChannelFactory>>,

    session: Option<Arc<Session>>,
    process: Arc<KernelProcessSlot>,
    control: Option<Arc<dyn Channel>>,
    control_state: Arc<ControlState>,
    control_loop: Option<JoinHandle<()>>,
}

impl KernelManager {
    /// Create a manager for the kernel named `kernel_name`.
    pub fn new(
        kernel_name: &str,
        specs: &dyn KernelSpecProvider,
        options: KernelManagerOptions,
    ) -> Result<Self, KMError> {
        let spec = specs.kernel_spec(kernel_name)?;
        Ok(Self::from_spec(kernel_name, spec, options))
    }

    /// Create a manager for an already loaded kernel spec.
    pub fn from_spec(kernel_name: &str, spec: KernelSpec, options: KernelManagerOptions) -> Self {
        let path = options
            .connection_file
            .clone()
            .unwrap_or_else(ConnectionFile::default_path);
        let info = ConnectionInfo {
            ip: options.ip.clone(),
            transport: options.transport.clone(),
            kernel_name: spec.display_name.clone(),
            ..ConnectionInfo::default()
        };
        Self {
            kernel_name: kernel_name.to_string(),
            spec,
            options,
            connection_file: ConnectionFile::from_info(info, path),
            channel_factory: None,
            session: None,
            process: Arc::new(KernelProcessSlot::default()),
            control: None,
            control_state: Arc::new(ControlState::default()),
            control_loop: None,
        }
    }

    /// Open channels through `factory` rather than over ZeroMQ.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn kernel_spec(&self) -> &KernelSpec {
        &self.spec
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_file.info
    }

    pub fn connection_file_path(&self) -> &Path {
        &self.connection_file.path
    }

    /// Whether a kernel process has been started and not yet shut down.
    pub fn has_kernel(&self) -> bool {
        self.process.is_some()
    }

    /// Whether the kernel process is running.
    pub fn is_alive(&self) -> bool {
        self.process.is_alive()
    }

    /// The kernel command line: the kernel spec's `argv` with placeholders
    /// filled in, followed by `extra_args`.
    pub fn format_kernel_cmd(&self, extra_args: &[String]) -> Vec<String> {
        startup::format_kernel_cmd(
            &self.spec.argv,
            extra_args,
            &self.connection_file.path,
            &self.spec.resource_dir,
        )
    }

    /// Launch the kernel and open the control channel.
    pub async fn start_kernel(&mut self, extra_args: &[String]) -> Result<(), KMError> {
        if self.has_kernel() {
            return Err(KMError::Config(format!(
                "kernel '{}' is already running",
                self.kernel_name
            )));
        }

        // Refuse remote addresses and other transports before touching disk
        self.connection_file.validate()?;
        self.connection_file.generate_key();
        self.connection_file.write()?;

        let argv = self.format_kernel_cmd(extra_args);
        let env = EnvironmentResolver::new().resolve(&[&self.spec.env, &self.options.env]);
        log::debug!("[kernel {}] Starting kernel: {:?}", self.kernel_name, argv);

        let command = startup::build_command(&argv, &env)?;
        let process = match KernelProcess::spawn(&self.kernel_name, command) {
            Ok(process) => process,
            Err(err) => {
                self.connection_file.cleanup();
                return Err(err);
            }
        };
        self.process.set(Some(process.clone()));

        // Give the kernel a moment to bind its sockets, unless it dies first
        tokio::select! {
            _ = tokio::time::sleep(self.options.launch_settle_time) => {}
            _ = process.exited() => {}
        }

        let session = Arc::new(Session::new(self.connection_file.info.key_bytes()));
        if let Err(err) = self.open_control(session.clone(), &process).await {
            log::error!(
                "[kernel {}] Could not open the control channel: {}",
                self.kernel_name,
                err
            );
            process.kill(KILL_WAIT).await;
            self.process.set(None);
            self.connection_file.cleanup();
            return Err(err);
        }
        self.session = Some(session);
        Ok(())
    }

    fn factory_for(&self, session: &Session) -> Arc<dyn ChannelFactory> {
        match &self.channel_factory {
            Some(factory) => factory.clone(),
            None => Arc::new(
                ZmqChannelFactory::new(self.connection_file.info.clone(), session)
                    .with_connect_timeout(self.options.connect_timeout),
            ),
        }
    }

    fn exit_code(&self) -> Option<i32> {
        self.process.get().and_then(|process| process.exit_code())
    }

    async fn open_control(
        &mut self,
        session: Arc<Session>,
        process: &KernelProcess,
    ) -> Result<(), KMError> {
        let factory = self.factory_for(&session);

        // A kernel that dies at launch never binds its ports
        let control = tokio::select! {
            biased;
            _ = process.exited() => Err(KMError::KernelExited(process.exit_code())),
            created = factory.create_channel(JupyterChannel::Control) => created,
        }?;
        control.start();

        let state = Arc::new(ControlState::default());
        let kernel: Arc<dyn KernelLiveness> = self.process.clone();
        self.control_loop = Some(tokio::spawn(lifecycle::run_control_loop(
            session,
            control.clone(),
            kernel,
            state.clone(),
        )));
        self.control_state = state;
        self.control = Some(control);
        Ok(())
    }

    /// Create a client for the running kernel and start its channels.
    pub async fn create_client(&self) -> Result<KernelClient, KMError> {
        let Some(process) = self.process.get() else {
            return Err(KMError::Config(format!(
                "kernel '{}' has not been started",
                self.kernel_name
            )));
        };
        let session = Session::new(self.connection_file.info.key_bytes());
        let factory = self.factory_for(&session);
        let owner: Arc<dyn KernelLiveness> = self.process.clone();
        let client = KernelClient::with_factory(session, factory, Some(owner));

        let started = tokio::select! {
            biased;
            _ = process.exited() => Err(KMError::KernelExited(process.exit_code())),
            started = client.start_channels(StartOptions::default()) => started,
        };
        if let Err(err) = started {
            client.stop_channels().await;
            return Err(err);
        }
        Ok(client)
    }

    /// Create a client and wait for the kernel to publish on iopub. If it
    /// doesn't within `timeout`, or the client's channels could not connect,
    /// the client is torn down and a new one is tried, up to `attempts`
    /// clients in all. Gives up early if the kernel process exits.
    pub async fn create_client_and_wait_for_connection(
        &self,
        attempts: u32,
        timeout: Duration,
    ) -> Result<KernelClient, KMError> {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            match self.create_client().await {
                Ok(client) => {
                    if client.wait_for_connection(timeout).await {
                        return Ok(client);
                    }
                    log::warn!(
                        "[kernel {}] Kernel did not connect within {:?} (attempt {} of {})",
                        self.kernel_name,
                        timeout,
                        attempt,
                        attempts
                    );
                    client.stop_channels().await;
                }
                Err(err) if err.is_config() => return Err(err),
                Err(err) => log::warn!(
                    "[kernel {}] Could not open a client (attempt {} of {}): {}",
                    self.kernel_name,
                    attempt,
                    attempts,
                    err
                ),
            }
            if !self.is_alive() {
                return Err(KMError::KernelExited(self.exit_code()));
            }
        }
        Err(KMError::ConnectionTimeout(attempts))
    }

    /// Shut the kernel down: ask it politely over the control channel, and
    /// kill it if it doesn't answer in time. The connection file is removed
    /// either way.
    pub async fn shutdown(&mut self) -> ShutdownOutcome {
        let Some(process) = self.process.get() else {
            self.connection_file.cleanup();
            return ShutdownOutcome::NotRunning;
        };

        let mut outcome = ShutdownOutcome::Killed;
        if !process.is_alive() {
            outcome = ShutdownOutcome::AlreadyExited;
        } else if let (Some(session), Some(control)) = (&self.session, &self.control) {
            if lifecycle::request_shutdown(
                session,
                control.as_ref(),
                &self.control_state,
                self.options.shutdown_wait,
                self.options.shutdown_poll_interval,
            )
            .await
            {
                outcome = ShutdownOutcome::Acknowledged;
            }
        }

        self.stop_control().await;

        match outcome {
            ShutdownOutcome::Acknowledged => {
                if !process.wait_for_exit(self.options.shutdown_wait).await {
                    log::warn!(
                        "[kernel {}] Kernel acknowledged shutdown but is still running",
                        self.kernel_name
                    );
                    process.kill(KILL_WAIT).await;
                }
            }
            ShutdownOutcome::Killed => {
                log::warn!(
                    "[kernel {}] Kernel did not acknowledge shutdown within {:?}",
                    self.kernel_name,
                    self.options.shutdown_wait
                );
                if !process.kill(KILL_WAIT).await {
                    log::error!(
                        "[kernel {}] Kernel process (pid {:?}) did not exit after being killed",
                        self.kernel_name,
                        process.pid()
                    );
                }
            }
            _ => {}
        }

        self.connection_file.cleanup();
        self.process.set(None);
        self.session = None;
        outcome
    }

    async fn stop_control(&mut self) {
        self.control_state.stop();
        if let Some(control) = self.control.take() {
            control.stop().await;
        }
        if let Some(control_loop) = self.control_loop.take() {
            if let Err(err) = control_loop.await {
                log::debug!(
                    "[kernel {}] Control loop ended abnormally: {}",
                    self.kernel_name,
                    err
                );
            }
        }
    }
}

impl Drop for KernelManager {
    fn drop(&mut self) {
        self.control_state.stop();
        if let Some(process) = self.process.take() {
            if process.is_alive() {
                log::warn!(
                    "[kernel {}] Kernel manager dropped without shutdown; killing kernel",
                    self.kernel_name
                );
                process.request_kill();
            }
        }
        self.connection_file.cleanup();
    }
}

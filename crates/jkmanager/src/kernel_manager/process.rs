//
// process.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Child process management for kernels.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use event_listener::Event;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

use crate::error::KMError;
use crate::kernel_client::KernelLiveness;
use crate::locks::lock;

/// A running kernel process.
///
/// The child is owned by a background task that waits for it to exit; the
/// rest of the kernel manager observes and controls it through this handle.
pub struct KernelProcess {
    kernel_name: String,
    pid: Option<u32>,
    exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,

    /// Fires when the process exits
    exit_event: Event,

    kill_requested: AtomicBool,
    kill_event: Event,
}

impl KernelProcess {
    /// Start the kernel process, forwarding its output to the log.
    pub fn spawn(kernel_name: &str, mut command: Command) -> Result<Arc<Self>, KMError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            KMError::ProcessStartFailed(anyhow::anyhow!(
                "Could not start kernel '{}': {}",
                kernel_name,
                err
            ))
        })?;

        let process = Arc::new(Self {
            kernel_name: kernel_name.to_string(),
            pid: child.id(),
            exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            exit_event: Event::new(),
            kill_requested: AtomicBool::new(false),
            kill_event: Event::new(),
        });
        log::info!(
            "[kernel {}] Started kernel process (pid {:?})",
            kernel_name,
            process.pid
        );

        process.capture_output_streams(&mut child);
        tokio::spawn(process.clone().run_child(child));
        Ok(process)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// The exit code, once the process has exited (None if it was killed by
    /// a signal).
    pub fn exit_code(&self) -> Option<i32> {
        *lock(&self.exit_code)
    }

    /// Wait up to `wait` for the process to exit. Returns true if it has.
    pub async fn wait_for_exit(&self, wait: Duration) -> bool {
        let exit_listener = self.exit_event.listen();
        if !self.is_alive() {
            return true;
        }
        timeout(wait, exit_listener).await.is_ok() || !self.is_alive()
    }

    /// Resolves once the process has exited.
    pub async fn exited(&self) {
        loop {
            let exit_listener = self.exit_event.listen();
            if !self.is_alive() {
                return;
            }
            exit_listener.await;
        }
    }

    /// Ask for the process to be killed without waiting for it.
    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.kill_event.notify(usize::MAX);
    }

    /// Kill the process and wait up to `wait` for it to go away.
    pub async fn kill(&self, wait: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        log::info!("[kernel {}] Killing kernel process", self.kernel_name);
        self.request_kill();
        self.wait_for_exit(wait).await
    }

    /// Wait for the child to exit (or kill it on request), then record how
    /// it ended.
    async fn run_child(self: Arc<Self>, mut child: Child) {
        let status = loop {
            let kill_listener = self.kill_event.listen();
            if self.kill_requested.load(Ordering::SeqCst) {
                if let Err(err) = child.start_kill() {
                    log::debug!(
                        "[kernel {}] Could not kill kernel process: {}",
                        self.kernel_name,
                        err
                    );
                }
                break child.wait().await;
            }
            tokio::select! {
                status = child.wait() => break status,
                _ = kill_listener => {}
            }
        };

        match status {
            Ok(status) => {
                log::info!(
                    "[kernel {}] Kernel process exited with status: {}",
                    self.kernel_name,
                    status
                );
                *lock(&self.exit_code) = status.code();
            }
            Err(err) => {
                log::error!(
                    "[kernel {}] Failed to wait on kernel process: {}",
                    self.kernel_name,
                    err
                );
            }
        }

        self.exited.store(true, Ordering::SeqCst);
        self.exit_event.notify(usize::MAX);
    }

    /// Capture stdout and stderr from the child process and forward them to
    /// the log.
    fn capture_output_streams(&self, child: &mut Child) {
        if let Some(stdout) = child.stdout.take() {
            Self::stream_output(stdout, "stdout", self.kernel_name.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            Self::stream_output(stderr, "stderr", self.kernel_name.clone());
        }
    }

    fn stream_output<T: AsyncRead + Unpin + Send + 'static>(
        stream: T,
        kind: &'static str,
        kernel_name: String,
    ) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => log::debug!("[kernel {}] {}: {}", kernel_name, kind, line),
                    Ok(None) => break,
                    Err(err) => {
                        log::debug!(
                            "[kernel {}] Stopped reading {}: {}",
                            kernel_name,
                            kind,
                            err
                        );
                        break;
                    }
                }
            }
        });
    }
}

/// The kernel process a manager is currently supervising, if any. Clients
/// created by the manager hold this to answer `is_alive`.
#[derive(Default)]
pub struct KernelProcessSlot {
    process: Mutex<Option<Arc<KernelProcess>>>,
}

impl KernelProcessSlot {
    pub fn get(&self) -> Option<Arc<KernelProcess>> {
        lock(&self.process).clone()
    }

    pub fn set(&self, process: Option<Arc<KernelProcess>>) {
        *lock(&self.process) = process;
    }

    pub fn take(&self) -> Option<Arc<KernelProcess>> {
        lock(&self.process).take()
    }

    pub fn is_some(&self) -> bool {
        lock(&self.process).is_some()
    }
}

impl KernelLiveness for KernelProcessSlot {
    fn is_alive(&self) -> bool {
        lock(&self.process)
            .as_ref()
            .is_some_and(|process| process.is_alive())
    }
}

//
// lifecycle.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! The control channel loop and the shutdown handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use event_listener::Event;
use jkshared::jupyter_message::msg_type;
use tokio::time::{Duration, Instant};

use crate::channel::Channel;
use crate::error::KMError;
use crate::jupyter_messages::{JupyterMsg, JupyterShutdownRequest};
use crate::kernel_client::KernelLiveness;
use crate::session::Session;

/// How long the control loop waits for a message before checking whether it
/// should keep running
const CONTROL_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// State shared between the kernel manager and its control loop.
#[derive(Default)]
pub struct ControlState {
    shutdown_acknowledged: AtomicBool,
    stopping: AtomicBool,
    exit_event: Event,
}

impl ControlState {
    pub fn shutdown_acknowledged(&self) -> bool {
        self.shutdown_acknowledged.load(Ordering::SeqCst)
    }

    /// Tell the control loop to exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.exit_event.notify(usize::MAX);
    }
}

/// Poll the control channel until the manager stops the loop or the kernel
/// goes away, watching for the kernel's `shutdown_reply`.
pub async fn run_control_loop(
    session: Arc<Session>,
    channel: Arc<dyn Channel>,
    kernel: Arc<dyn KernelLiveness>,
    state: Arc<ControlState>,
) {
    match poll_control(&session, &channel, kernel.as_ref(), &state).await {
        Ok(()) => log::debug!(
            "[session {}] Control channel loop exited.",
            session.session_id()
        ),
        Err(err) => log::error!(
            "[session {}] Stopped polling the control channel: {}",
            session.session_id(),
            err
        ),
    }
}

async fn poll_control(
    session: &Session,
    channel: &Arc<dyn Channel>,
    kernel: &dyn KernelLiveness,
    state: &ControlState,
) -> Result<(), KMError> {
    loop {
        let exit_listener = state.exit_event.listen();
        if state.stopping.load(Ordering::SeqCst) || !channel.is_alive() || !kernel.is_alive() {
            return Ok(());
        }
        let received = tokio::select! {
            _ = exit_listener => return Ok(()),
            received = channel.try_receive(CONTROL_POLL_TIMEOUT) => received?,
        };
        let Some(msg) = received else {
            continue;
        };

        session.adopt_session_id(&msg.header.session);
        if let JupyterMsg::ShutdownReply(reply) = JupyterMsg::from(&msg) {
            log::info!(
                "[session {}] Kernel acknowledged shutdown (status {}).",
                session.session_id(),
                reply.status.as_deref().unwrap_or("unknown")
            );
            state.shutdown_acknowledged.store(true, Ordering::SeqCst);
        }
    }
}

/// Ask the kernel to shut down and wait up to `budget` for it to say it
/// will. Returns true if the kernel acknowledged the request.
pub async fn request_shutdown(
    session: &Session,
    channel: &dyn Channel,
    state: &ControlState,
    budget: Duration,
    poll_interval: Duration,
) -> bool {
    let content = match serde_json::to_value(JupyterShutdownRequest { restart: false }) {
        Ok(content) => content,
        Err(err) => {
            log::error!("Could not build shutdown request: {}", err);
            return false;
        }
    };
    let request = session.new_message(msg_type::SHUTDOWN_REQUEST, content);
    match channel.send(&request).await {
        Ok(true) => log::debug!(
            "[session {}] Sent shutdown request.",
            session.session_id()
        ),
        Ok(false) => {
            log::warn!(
                "[session {}] Control channel is closed; cannot request shutdown.",
                session.session_id()
            );
            return false;
        }
        Err(err) => {
            log::warn!(
                "[session {}] Could not send shutdown request: {}",
                session.session_id(),
                err
            );
            return false;
        }
    }

    let deadline = Instant::now() + budget;
    loop {
        if state.shutdown_acknowledged() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

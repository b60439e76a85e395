//
// error.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;
use std::time::Duration;

use jkshared::jupyter_message::JupyterChannel;
use log::error;

#[derive(Debug)]
pub enum KMError {
    /// The kernel manager was asked to do something its configuration does
    /// not allow (remote addresses, unsupported transports)
    Config(String),
    NoSuchKernel(String),
    InvalidKernelSpec(String, String),
    ProtocolViolation(String),
    SignatureMismatch(String),
    Transport(JupyterChannel, zeromq::ZmqError),
    Json(serde_json::Error),
    Io(std::io::Error),
    ChannelNotAlive(JupyterChannel),
    ProcessStartFailed(anyhow::Error),
    ConnectionTimeout(u32),
    ConnectTimeout(JupyterChannel, Duration),

    /// The kernel process exited while it was being connected to
    KernelExited(Option<i32>),
}

impl fmt::Display for KMError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Error KM-{}: ", self.code())?;
        match self {
            KMError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            KMError::NoSuchKernel(name) => write!(f, "No such kernel named '{}'", name),
            KMError::InvalidKernelSpec(name, reason) => {
                write!(f, "Kernel spec '{}' could not be loaded: {}", name, reason)
            }
            KMError::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            KMError::SignatureMismatch(msg_type) => {
                write!(f, "Signature mismatch on '{}' message", msg_type)
            }
            KMError::Transport(channel, err) => {
                write!(f, "Transport failure on {} channel: {}", channel, err)
            }
            KMError::Json(err) => write!(f, "Invalid JSON: {}", err),
            KMError::Io(err) => write!(f, "I/O error: {}", err),
            KMError::ChannelNotAlive(channel) => {
                write!(f, "The {} channel is not alive", channel)
            }
            KMError::ProcessStartFailed(err) => {
                write!(f, "Failed to start kernel process: {}", err)
            }
            KMError::ConnectionTimeout(attempts) => write!(
                f,
                "Kernel did not connect after {} attempt{}",
                attempts,
                if *attempts == 1 { "" } else { "s" }
            ),
            KMError::ConnectTimeout(channel, wait) => write!(
                f,
                "Could not connect to the {} channel within {:?}",
                channel, wait
            ),
            KMError::KernelExited(Some(code)) => {
                write!(f, "Kernel exited during startup with code {}", code)
            }
            KMError::KernelExited(None) => write!(f, "Kernel exited during startup"),
        }
    }
}

impl std::error::Error for KMError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KMError::Transport(_, err) => Some(err),
            KMError::Json(err) => Some(err),
            KMError::Io(err) => Some(err),
            KMError::ProcessStartFailed(err) => Some(&**err),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KMError {
    fn from(err: serde_json::Error) -> Self {
        KMError::Json(err)
    }
}

impl From<std::io::Error> for KMError {
    fn from(err: std::io::Error) -> Self {
        KMError::Io(err)
    }
}

impl KMError {
    /// A stable numeric code for the kind of error.
    pub fn code(&self) -> u8 {
        match self {
            KMError::Config(_) => 1,
            KMError::NoSuchKernel(_) => 2,
            KMError::InvalidKernelSpec(_, _) => 3,
            KMError::ProtocolViolation(_) => 4,
            KMError::SignatureMismatch(_) => 5,
            KMError::Transport(_, _) => 6,
            KMError::Json(_) => 7,
            KMError::Io(_) => 8,
            KMError::ChannelNotAlive(_) => 9,
            KMError::ProcessStartFailed(_) => 10,
            KMError::ConnectionTimeout(_) => 11,
            KMError::ConnectTimeout(_, _) => 12,
            KMError::KernelExited(_) => 13,
        }
    }

    /// Whether this error is a configuration problem the caller must fix, as
    /// opposed to a runtime failure.
    pub fn is_config(&self) -> bool {
        matches!(self, KMError::Config(_))
    }

    pub fn log(&self) {
        error!("{}", self);
    }
}

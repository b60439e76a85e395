//
// connection_info.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use serde::{Deserialize, Serialize};

/// The only transport the kernel manager can launch kernels over.
pub const TCP_TRANSPORT: &str = "tcp";

/// The only signature scheme the kernel manager understands.
pub const HMAC_SHA256: &str = "hmac-sha256";

/// The contents of a Jupyter connection file.
///
/// A port of 0 means the port has not been allocated yet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    /// The port for shell messages
    pub shell_port: u16,

    /// The port for IOPub messages
    pub iopub_port: u16,

    /// The port for stdin messages
    pub stdin_port: u16,

    /// The port for heartbeat messages
    pub hb_port: u16,

    /// The port for control messages
    pub control_port: u16,

    /// The IP address for the connection
    pub ip: String,

    /// The key used to sign messages; empty when messages are unsigned
    pub key: String,

    /// The transport protocol
    pub transport: String,

    /// The signature scheme for messages
    pub signature_scheme: String,

    /// The display name of the kernel
    #[serde(default)]
    pub kernel_name: String,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            shell_port: 0,
            iopub_port: 0,
            stdin_port: 0,
            hb_port: 0,
            control_port: 0,
            ip: String::from("127.0.0.1"),
            key: String::new(),
            transport: String::from(TCP_TRANSPORT),
            signature_scheme: String::from(HMAC_SHA256),
            kernel_name: String::new(),
        }
    }
}

impl ConnectionInfo {
    /// The raw bytes of the signing key.
    pub fn key_bytes(&self) -> &[u8] {
        self.key.as_bytes()
    }

    /// The endpoint address for one of the kernel's ports.
    pub fn endpoint(&self, port: u16) -> String {
        make_url(&self.transport, &self.ip, port)
    }

    /// Whether every port has been assigned.
    pub fn ports_assigned(&self) -> bool {
        [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.hb_port,
            self.control_port,
        ]
        .iter()
        .all(|port| *port != 0)
    }
}

/// Form a ZeroMQ endpoint address.
///
/// TCP endpoints take the form `tcp://ip:port`; other transports (e.g. `ipc`)
/// name a path, so the port is joined to it with a dash.
pub fn make_url(transport: &str, ip: &str, port: u16) -> String {
    if transport == TCP_TRANSPORT {
        format!("{}://{}:{}", transport, ip, port)
    } else {
        format!("{}://{}-{}", transport, ip, port)
    }
}

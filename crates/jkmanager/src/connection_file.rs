//
// connection_file.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use jkshared::connection_info::{ConnectionInfo, HMAC_SHA256, TCP_TRANSPORT};

use crate::error::KMError;
use crate::session::make_key;

/// Length in bytes of the random part of a generated signing key
const KEY_LENGTH: usize = 32;

/// A Jupyter connection file: the connection info plus where it lives on
/// disk.
#[derive(Debug, Clone)]
pub struct ConnectionFile {
    pub info: ConnectionInfo,
    pub path: PathBuf,
    written: bool,
}

impl ConnectionFile {
    /// Create a ConnectionFile from a ConnectionInfo struct. Nothing is
    /// written until `write` is called.
    pub fn from_info(info: ConnectionInfo, path: PathBuf) -> Self {
        Self {
            info,
            path,
            written: false,
        }
    }

    /// Create a ConnectionFile by parsing the contents of a connection file.
    pub fn from_file<P: AsRef<Path>>(connection_file: P) -> Result<Self, KMError> {
        let path = connection_file.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let reader = BufReader::new(file);
        let info: ConnectionInfo = serde_json::from_reader(reader)?;

        Ok(Self {
            info,
            path,
            written: false,
        })
    }

    /// A fresh, unique connection file path in the temporary directory.
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(format!("kernel-{}.json", uuid::Uuid::new_v4()))
    }

    /// Generate a new signing key for the kernel.
    pub fn generate_key(&mut self) {
        self.info.key = make_key(KEY_LENGTH);
        self.info.signature_scheme = String::from(HMAC_SHA256);
    }

    /// Check that a kernel can be launched locally with this connection info.
    pub fn validate(&self) -> Result<(), KMError> {
        if self.info.transport != TCP_TRANSPORT {
            return Err(KMError::Config(format!(
                "transport '{}' is not supported; only '{}' is",
                self.info.transport, TCP_TRANSPORT
            )));
        }
        if !is_local_ip(&self.info.ip) {
            return Err(KMError::Config(format!(
                "can only launch a kernel on the local machine, not on '{}'",
                self.info.ip
            )));
        }
        if self.info.signature_scheme != HMAC_SHA256 {
            return Err(KMError::Config(format!(
                "signature scheme '{}' is not supported",
                self.info.signature_scheme
            )));
        }
        Ok(())
    }

    /// Assign a free port to every port that is still 0.
    pub fn assign_ports(&mut self) -> Result<(), KMError> {
        let mut reserved: Vec<u16> = [
            self.info.shell_port,
            self.info.iopub_port,
            self.info.stdin_port,
            self.info.hb_port,
            self.info.control_port,
        ]
        .into_iter()
        .filter(|port| *port != 0)
        .collect();

        for (name, port) in [
            ("shell", &mut self.info.shell_port),
            ("iopub", &mut self.info.iopub_port),
            ("stdin", &mut self.info.stdin_port),
            ("heartbeat", &mut self.info.hb_port),
            ("control", &mut self.info.control_port),
        ] {
            if *port == 0 {
                *port = find_port(name, &mut reserved)
                    .map_err(KMError::ProcessStartFailed)?;
            }
        }
        Ok(())
    }

    /// Write the connection file, assigning any missing ports first. Does
    /// nothing if the file has already been written.
    pub fn write(&mut self) -> Result<(), KMError> {
        if self.written && self.path.exists() {
            return Ok(());
        }
        self.validate()?;
        self.assign_ports()?;

        let file = File::create(&self.path)?;
        serde_json::to_writer_pretty(file, &self.info)?;
        self.written = true;
        log::debug!("Wrote connection file {}", self.path.display());
        Ok(())
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Delete the connection file if we wrote it. Failures are logged and
    /// otherwise ignored.
    pub fn cleanup(&mut self) {
        if !self.written {
            return;
        }
        self.written = false;
        if let Err(err) = std::fs::remove_file(&self.path) {
            log::debug!(
                "Could not remove connection file {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

/// Whether `ip` names this machine.
pub fn is_local_ip(ip: &str) -> bool {
    if ip.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match ip.parse::<IpAddr>() {
        Ok(addr) => addr.is_loopback(),
        Err(_) => false,
    }
}

/// Find a free port that is not in the reserved list, and reserve it.
///
/// # Arguments
///
/// * `name` - The name of the port to find. This is used for logging.
/// * `reserved_ports` - Ports that should not be used.
fn find_port(name: &str, reserved_ports: &mut Vec<u16>) -> Result<u16, anyhow::Error> {
    // The number of times we've tried to find an unused, unreserved port
    let mut tries = 0;

    loop {
        let candidate = match portpicker::pick_unused_port() {
            Some(port) => port,
            None => {
                return Err(anyhow::anyhow!(
                    "Failed to pick {} port; no free ports available or port range exhausted",
                    name
                ));
            }
        };

        // Hitting a reserved port is unlikely but possible; if it keeps
        // happening something is wrong
        if reserved_ports.contains(&candidate) {
            tries += 1;
            if tries > 10 {
                return Err(anyhow::anyhow!(
                    "Failed to pick unreserved {} port after 10 tries",
                    name
                ));
            }
            log::trace!(
                "Port {} is reserved; trying again (attempt {})",
                candidate,
                tries
            );
            continue;
        }

        reserved_ports.push(candidate);
        log::trace!(
            "Picked {} port: {} ({} ports reserved)",
            name,
            candidate,
            reserved_ports.len()
        );
        return Ok(candidate);
    }
}

//
// session.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Session identity and message signing.

use std::sync::RwLock;

use hmac::{Hmac, Mac};
use jkshared::jupyter_message::{JupyterMessage, JupyterMessageHeader};
use rand::Rng;
use sha2::Sha256;

/// The Jupyter protocol version stamped on outgoing messages
pub const PROTOCOL_VERSION: &str = "5.3";

/// Signs and verifies the four content frames of a message.
///
/// Each channel gets its own `Signer`, derived from the session's key, so
/// that channels never share HMAC state. A signer without a key runs in
/// unsigned mode: it produces an empty signature and accepts anything.
#[derive(Clone)]
pub struct Signer {
    hmac_key: Option<Hmac<Sha256>>,
}

impl Signer {
    /// Create a signer from raw key bytes; an empty key disables signing.
    pub fn new(key: &[u8]) -> Self {
        if key.is_empty() {
            return Self::unsigned();
        }
        // HMAC accepts keys of any length, so this cannot fail in practice
        match Hmac::<Sha256>::new_from_slice(key) {
            Ok(hmac_key) => Self {
                hmac_key: Some(hmac_key),
            },
            Err(err) => {
                log::error!("Invalid HMAC key; messages will be unsigned: {}", err);
                Self::unsigned()
            }
        }
    }

    pub fn unsigned() -> Self {
        Self { hmac_key: None }
    }

    pub fn is_signing(&self) -> bool {
        self.hmac_key.is_some()
    }

    fn digest<T: AsRef<[u8]>>(&self, frames: &[T]) -> Option<Hmac<Sha256>> {
        let mut mac = self.hmac_key.clone()?;
        for frame in frames {
            mac.update(frame.as_ref());
        }
        Some(mac)
    }

    /// Compute the hex-encoded signature over the given frames. Returns an
    /// empty string in unsigned mode.
    pub fn sign<T: AsRef<[u8]>>(&self, frames: &[T]) -> String {
        match self.digest(frames) {
            Some(mac) => hex::encode(mac.finalize().into_bytes()),
            None => String::new(),
        }
    }

    /// Check a hex-encoded signature against the given frames.
    pub fn verify<T: AsRef<[u8]>>(&self, frames: &[T], signature: &[u8]) -> bool {
        let Some(mac) = self.digest(frames) else {
            return true;
        };
        let Ok(claimed) = hex::decode(signature) else {
            return false;
        };
        mac.verify_slice(&claimed).is_ok()
    }
}

/// A client's identity on the wire: its session ID, username and signing key.
pub struct Session {
    session_id: RwLock<String>,
    username: String,
    signer: Signer,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    /// Create a session with a fresh session ID, signing with `key`.
    pub fn new(key: &[u8]) -> Self {
        Self::with_id(make_session_id(), key)
    }

    /// Create a session with a specific session ID. An empty ID is adopted
    /// from the first message received from the kernel.
    pub fn with_id(session_id: String, key: &[u8]) -> Self {
        Self {
            session_id: RwLock::new(session_id),
            username: default_username(),
            signer: Signer::new(key),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn session_id(&self) -> String {
        match self.session_id.read() {
            Ok(id) => id.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Adopt `session_id` if this session does not have one yet. Returns true
    /// if the ID was adopted.
    pub fn adopt_session_id(&self, session_id: &str) -> bool {
        let mut current = match self.session_id.write() {
            Ok(id) => id,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !current.is_empty() || session_id.is_empty() {
            return false;
        }
        *current = session_id.to_string();
        true
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Derive an independent signer from this session's key.
    pub fn signer(&self) -> Signer {
        self.signer.clone()
    }

    /// Create a new message of the given type, stamped with a fresh header.
    pub fn new_message(&self, msg_type: &str, content: serde_json::Value) -> JupyterMessage {
        let header = JupyterMessageHeader {
            msg_id: make_message_id(),
            username: self.username.clone(),
            session: self.session_id(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            date: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };
        let mut msg = JupyterMessage::new(header, content);
        msg.metadata = serde_json::Value::Object(self.metadata.clone());
        msg
    }
}

/// Generate a new random message ID.
pub fn make_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a new random session ID.
pub fn make_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a new signing key: `len` random bytes rendered as hex, split
/// after the first eight characters the way Jupyter formats its keys.
pub fn make_key(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill(bytes.as_mut_slice());
    let hex = hex::encode(bytes);
    if hex.len() <= 8 {
        return hex;
    }
    format!("{}-{}", &hex[..8], &hex[8..])
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| String::from("username"))
}

//
// jupyter_message.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message types the kernel manager produces or inspects. The set of message
/// types on the wire is open; anything not listed here is carried through
/// untouched.
pub mod msg_type {
    pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
    pub const KERNEL_INFO_REPLY: &str = "kernel_info_reply";
    pub const EXECUTE_REQUEST: &str = "execute_request";
    pub const EXECUTE_REPLY: &str = "execute_reply";
    pub const DISPLAY_DATA: &str = "display_data";
    pub const STREAM: &str = "stream";
    pub const EXECUTE_RESULT: &str = "execute_result";
    pub const ERROR: &str = "error";
    pub const STATUS: &str = "status";
    pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
    pub const SHUTDOWN_REPLY: &str = "shutdown_reply";
}

/// The header of a Jupyter message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterMessageHeader {
    /// The message ID; unique per message
    pub msg_id: String,

    /// The user that sent the message
    #[serde(default)]
    pub username: String,

    /// The session that sent the message
    #[serde(default)]
    pub session: String,

    /// The type of the message
    pub msg_type: String,

    /// The version of the message protocol
    #[serde(default)]
    pub version: String,

    /// The date the message was created, in ISO 8601 format
    #[serde(default)]
    pub date: String,
}

/// The set of all Jupyter sockets ("channels") over which messages are sent and
/// received.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JupyterChannel {
    /// The shell channel
    Shell,

    /// The control channel
    Control,

    /// The stdin channel
    Stdin,

    /// The iopub channel
    IOPub,

    /// The heartbeat channel
    Heartbeat,
}

impl JupyterChannel {
    /// The conventional short name of the channel.
    pub fn name(&self) -> &'static str {
        match self {
            JupyterChannel::Shell => "shell",
            JupyterChannel::Control => "control",
            JupyterChannel::Stdin => "stdin",
            JupyterChannel::IOPub => "iopub",
            JupyterChannel::Heartbeat => "hb",
        }
    }
}

impl fmt::Display for JupyterChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `status` field of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteStatus {
    Ok,
    Error,
    Abort,
    Aborted,

    /// A status value this crate does not know about
    Other(String),
}

impl ExecuteStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "ok" => ExecuteStatus::Ok,
            "error" => ExecuteStatus::Error,
            "abort" => ExecuteStatus::Abort,
            "aborted" => ExecuteStatus::Aborted,
            other => ExecuteStatus::Other(other.to_string()),
        }
    }

    /// Whether the request was aborted by the kernel rather than run.
    pub fn is_abort(&self) -> bool {
        matches!(self, ExecuteStatus::Abort | ExecuteStatus::Aborted)
    }
}

/// A Jupyter message, as exchanged with the kernel.
///
/// The content and metadata are kept as loosely typed JSON since their shape
/// depends on the message type; use the accessors below to pull out the few
/// fields that matter without failing on missing ones.
#[derive(Debug, Clone, PartialEq)]
pub struct JupyterMessage {
    /// The header of the message
    pub header: JupyterMessageHeader,

    /// The header of the message's parent (the message that caused this message)
    pub parent_header: Option<JupyterMessageHeader>,

    /// Additional metadata
    pub metadata: serde_json::Value,

    /// The message payload
    pub content: serde_json::Value,

    /// ZeroMQ routing identities that preceded the delimiter
    pub identities: Vec<Vec<u8>>,

    /// The raw (hex) signature the message arrived with, if any
    pub signature: Option<Vec<u8>>,
}

impl JupyterMessage {
    /// Create a message from a header and content, with empty metadata.
    pub fn new(header: JupyterMessageHeader, content: serde_json::Value) -> Self {
        Self {
            header,
            parent_header: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            content,
            identities: Vec::new(),
            signature: None,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The message ID of the parent, if this message is a reply.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// Turn this message into a reply to `parent`.
    ///
    /// A reply carries the parent's header, the parent's session ID, and the
    /// parent's routing identities so that a ROUTER peer can deliver it.
    pub fn reply_to(mut self, parent: &JupyterMessage) -> Self {
        self.header.session = parent.header.session.clone();
        self.parent_header = Some(parent.header.clone());
        self.identities = parent.identities.clone();
        self
    }

    /// Look up a field in the message content.
    pub fn content_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.content.as_object().and_then(|map| map.get(key))
    }

    fn content_str(&self, key: &str) -> Option<&str> {
        self.content_field(key).and_then(|v| v.as_str())
    }

    /// The `status` field of the content, if there is one.
    pub fn status(&self) -> Option<ExecuteStatus> {
        self.content_str("status").map(ExecuteStatus::parse)
    }

    pub fn ename(&self) -> Option<&str> {
        self.content_str("ename")
    }

    pub fn evalue(&self) -> Option<&str> {
        self.content_str("evalue")
    }

    pub fn execution_count(&self) -> Option<i64> {
        self.content_field("execution_count")
            .and_then(|v| v.as_i64())
    }

    /// Look up a MIME bundle entry (`content.data[mime]`).
    pub fn data(&self, mime: &str) -> Option<&serde_json::Value> {
        self.content_field("data")
            .and_then(|d| d.as_object())
            .and_then(|d| d.get(mime))
    }

    /// The "ename: evalue" description of an error carried by this message.
    pub fn error_summary(&self) -> Option<String> {
        match (self.ename(), self.evalue()) {
            (Some(ename), Some(evalue)) => Some(format!("{}: {}", ename, evalue)),
            (Some(ename), None) => Some(ename.to_string()),
            (None, Some(evalue)) => Some(evalue.to_string()),
            (None, None) => None,
        }
    }
}

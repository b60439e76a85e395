//
// jupyter_messages.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use jkshared::jupyter_message::{msg_type, ExecuteStatus, JupyterMessage};
use serde::{Deserialize, Serialize};

/// An enum of message types we know how to handle from Jupyter. This is in no
/// way exhaustive; it just includes the types we care about.
#[derive(Debug)]
pub enum JupyterMsg {
    /// An `execute_reply`, or an `error` published on iopub; both end an
    /// execution
    ExecuteReply(JupyterExecuteReply),

    /// Output produced by an execution (`display_data`, `stream`,
    /// `execute_result`)
    Data,

    ShutdownReply(JupyterShutdownReply),
    Status(JupyterStatus),
    Other,
}

/// Classify a JupyterMessage (generic type) into a JupyterMsg (specific type)
impl From<&JupyterMessage> for JupyterMsg {
    fn from(msg: &JupyterMessage) -> Self {
        match msg.msg_type() {
            msg_type::EXECUTE_REPLY | msg_type::ERROR => {
                match serde_json::from_value::<JupyterExecuteReply>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::ExecuteReply(content),
                    Err(_) => JupyterMsg::ExecuteReply(JupyterExecuteReply::default()),
                }
            }
            msg_type::DISPLAY_DATA | msg_type::STREAM | msg_type::EXECUTE_RESULT => {
                JupyterMsg::Data
            }
            msg_type::SHUTDOWN_REPLY => {
                match serde_json::from_value::<JupyterShutdownReply>(msg.content.clone()) {
                    Ok(content) => JupyterMsg::ShutdownReply(content),
                    Err(_) => JupyterMsg::ShutdownReply(JupyterShutdownReply::default()),
                }
            }
            msg_type::STATUS => match serde_json::from_value::<JupyterStatus>(msg.content.clone()) {
                Ok(content) => JupyterMsg::Status(content),
                Err(_) => JupyterMsg::Other,
            },
            _ => JupyterMsg::Other,
        }
    }
}

/// The content of an `execute_request`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JupyterExecuteRequest {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub user_expressions: serde_json::Map<String, serde_json::Value>,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl JupyterExecuteRequest {
    /// A request that runs `code` the way an interactive user would, without
    /// allowing the kernel to prompt for input.
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_string(),
            silent: false,
            store_history: true,
            user_expressions: serde_json::Map::new(),
            allow_stdin: false,
            stop_on_error: true,
        }
    }
}

/// The fields of an `execute_reply` or `error` message that matter for
/// tracking executions. All are optional; kernels vary in what they send.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct JupyterExecuteReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub execution_count: Option<i64>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
}

impl JupyterExecuteReply {
    pub fn status(&self) -> Option<ExecuteStatus> {
        self.status.as_deref().map(ExecuteStatus::parse)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct JupyterShutdownRequest {
    pub restart: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct JupyterShutdownReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub restart: bool,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Busy,
    Idle,
    Starting,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JupyterStatus {
    pub execution_state: ExecutionState,
}

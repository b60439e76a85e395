//
// execution_log.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;

use jkshared::jupyter_message::{ExecuteStatus, JupyterMessage};

/// Reported once for every execution that was abandoned
pub const ABANDONED_MESSAGE: &str =
    "Execution was abandoned; the kernel stopped responding or aborted the request";

/// The tracked state of a single execute request.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    /// The `execute_request` that started the execution
    pub request: JupyterMessage,

    /// Replies and outputs whose parent is the request, in arrival order
    pub responses: Vec<JupyterMessage>,

    /// The kernel's execution counter for this request, once known
    pub execution_index: Option<i64>,

    pub complete: bool,
    pub error: bool,

    /// No further replies are expected: the request was aborted or the
    /// channel that would have delivered them went away
    pub abandoned: bool,
}

impl ExecutionEntry {
    pub fn new(request: JupyterMessage) -> Self {
        Self {
            request,
            responses: Vec::new(),
            execution_index: None,
            complete: false,
            error: false,
            abandoned: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.complete && !self.abandoned
    }

    /// Whether anything about this execution went wrong. Responses without
    /// a `status` field (stream output, display data) never count.
    pub fn has_error(&self) -> bool {
        self.abandoned
            || self.error
            || self
                .responses
                .iter()
                .any(|r| matches!(r.status(), Some(status) if status != ExecuteStatus::Ok))
    }

    /// Record the terminal status of the execution.
    fn finish(&mut self, status: Option<ExecuteStatus>, execution_count: Option<i64>) {
        match status {
            Some(ExecuteStatus::Ok) => {
                self.complete = true;
                self.execution_index = execution_count;
            }
            Some(status) if status.is_abort() => {
                self.abandoned = true;
            }
            _ => {
                self.error = true;
                self.complete = true;
                if execution_count.is_some() {
                    self.execution_index = execution_count;
                }
            }
        }
    }
}

/// The log of every execute request sent by a client, keyed by message ID.
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Vec<ExecutionEntry>,
    index: HashMap<String, usize>,
}

impl ExecutionLog {
    /// Create a new, empty execution log
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request that is about to be sent.
    pub fn insert(&mut self, request: JupyterMessage) {
        let msg_id = request.header.msg_id.clone();
        if let Some(existing) = self.index.get(&msg_id) {
            log::warn!("Request {} is already being tracked; replacing it", msg_id);
            self.entries[*existing] = ExecutionEntry::new(request);
            return;
        }
        self.index.insert(msg_id, self.entries.len());
        self.entries.push(ExecutionEntry::new(request));
    }

    pub fn get(&self, msg_id: &str) -> Option<&ExecutionEntry> {
        self.index.get(msg_id).map(|i| &self.entries[*i])
    }

    fn get_mut(&mut self, msg_id: &str) -> Option<&mut ExecutionEntry> {
        match self.index.get(msg_id) {
            Some(i) => self.entries.get_mut(*i),
            None => None,
        }
    }

    /// Attach an output message to the request it belongs to. Returns false
    /// if the parent request is not in the log.
    pub fn record_output(&mut self, parent_id: &str, msg: JupyterMessage) -> bool {
        match self.get_mut(parent_id) {
            Some(entry) => {
                entry.responses.push(msg);
                true
            }
            None => false,
        }
    }

    /// Attach a terminal reply to the request it belongs to and update the
    /// request's state from the reply's status. Returns false if the parent
    /// request is not in the log.
    pub fn record_reply(
        &mut self,
        parent_id: &str,
        msg: JupyterMessage,
        status: Option<ExecuteStatus>,
        execution_count: Option<i64>,
    ) -> bool {
        match self.get_mut(parent_id) {
            Some(entry) => {
                entry.responses.push(msg);
                entry.finish(status, execution_count);
                true
            }
            None => false,
        }
    }

    /// Mark a single request as abandoned.
    pub fn abandon(&mut self, msg_id: &str) {
        if let Some(entry) = self.get_mut(msg_id) {
            entry.abandoned = true;
        }
    }

    /// Mark every pending request as abandoned; returns how many there were.
    pub fn abandon_pending(&mut self) -> usize {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.is_pending()) {
            entry.abandoned = true;
            count += 1;
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_pending()).count()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.is_pending())
    }

    pub fn has_error(&self) -> bool {
        self.entries.iter().any(|e| e.has_error())
    }

    /// Describe everything that went wrong: one "ename: evalue" line per
    /// error reply, plus one line for each abandoned request.
    pub fn errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for entry in &self.entries {
            errors.extend(entry.responses.iter().filter_map(|r| r.error_summary()));
            if entry.abandoned {
                errors.push(ABANDONED_MESSAGE.to_string());
            }
        }
        errors
    }

    /// A snapshot of every entry, in the order the requests were sent
    pub fn entries(&self) -> &[ExecutionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("Discarding {} execution log entries", self.entries.len());
        }
        self.entries.clear();
        self.index.clear();
    }
}

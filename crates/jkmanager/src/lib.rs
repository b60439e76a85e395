//
// lib.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! A client-side implementation of the Jupyter kernel wire protocol: launches
//! and supervises kernel processes, talks to them over signed ZeroMQ
//! channels, and tracks the execute requests sent to them.

#![allow(missing_docs)]

pub mod channel;
pub mod connection_file;
pub mod error;
pub mod execution_log;
pub mod heartbeat;
pub mod jupyter_messages;
pub mod kernel_client;
pub mod kernel_manager;
pub mod kernel_spec_manager;
mod locks;
pub mod session;
pub mod wire_message;

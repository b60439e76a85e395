//
// lib.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

pub mod connection_info;
pub mod jupyter_message;
pub mod kernel_spec;

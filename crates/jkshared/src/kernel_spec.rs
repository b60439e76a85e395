//
// kernel_spec.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// From the Jupyter documentation for [Kernel Specs](https://jupyter-client.readthedocs.io/en/stable/kernels.html#kernel-specs).
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KernelSpec {
    /// List of command line arguments to be used to start the kernel
    pub argv: Vec<String>,

    // The kernel name as it should be displayed in the UI
    pub display_name: String,

    // The kernel's language
    #[serde(default)]
    pub language: String,

    // How the kernel wants to be interrupted ("signal" or "message")
    pub interrupt_mode: Option<String>,

    // Environment variables to set for the kernel
    #[serde(default)]
    pub env: HashMap<String, String>,

    // Free-form metadata
    pub metadata: Option<serde_json::Value>,

    /// The directory the spec was loaded from; substituted for
    /// `{resource_dir}` in `argv`
    #[serde(skip)]
    pub resource_dir: PathBuf,
}

impl KernelSpec {
    /// Parse a kernel spec from the contents of a `kernel.json` file.
    pub fn from_json(json: &str, resource_dir: PathBuf) -> Result<Self, serde_json::Error> {
        let mut spec: KernelSpec = serde_json::from_str(json)?;
        spec.resource_dir = resource_dir;
        Ok(spec)
    }
}

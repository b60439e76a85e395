//
// startup.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Building the kernel command line.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::KMError;

/// Substitute `{connection_file}` and `{resource_dir}` in a kernel spec's
/// argument template, then append `extra_args`. Placeholders with other
/// names are left as they are.
pub fn format_kernel_cmd(
    argv: &[String],
    extra_args: &[String],
    connection_file: &Path,
    resource_dir: &Path,
) -> Vec<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("Invalid regex"));

    let values: HashMap<&str, String> = HashMap::from([
        ("connection_file", connection_file.display().to_string()),
        ("resource_dir", resource_dir.display().to_string()),
    ]);

    argv.iter()
        .map(|arg| {
            placeholder
                .replace_all(arg, |caps: &Captures| match values.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                })
                .into_owned()
        })
        .chain(extra_args.iter().cloned())
        .collect()
}

/// Build the command to start the kernel.
pub fn build_command(
    argv: &[String],
    resolved_env: &HashMap<String, String>,
) -> Result<tokio::process::Command, KMError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(KMError::ProcessStartFailed(anyhow::anyhow!(
            "No arguments provided"
        )));
    };
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(resolved_env);
    Ok(cmd)
}

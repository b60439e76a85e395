//
// kernel_spec_manager.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Finds installed kernel specs on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use jkshared::kernel_spec::KernelSpec;

use crate::error::KMError;

const KERNEL_FILE: &str = "kernel.json";

/// Looks up a kernel spec by name.
pub trait KernelSpecProvider: Send + Sync {
    fn kernel_spec(&self, kernel_name: &str) -> Result<KernelSpec, KMError>;
}

/// Finds kernel specs in the standard Jupyter data directories.
pub struct KernelSpecManager {
    /// `kernels` directories to search; later ones take priority
    kernel_dirs: Vec<PathBuf>,
}

impl Default for KernelSpecManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelSpecManager {
    /// Search the system data directories, then `JUPYTER_PATH`, then the
    /// user's data directory.
    pub fn new() -> Self {
        let mut data_dirs: Vec<PathBuf> = Vec::new();

        #[cfg(unix)]
        {
            data_dirs.push(PathBuf::from("/usr/share/jupyter"));
            data_dirs.push(PathBuf::from("/usr/local/share/jupyter"));
        }
        #[cfg(windows)]
        if let Ok(program_data) = std::env::var("PROGRAMDATA") {
            data_dirs.push(PathBuf::from(program_data).join("jupyter"));
        }

        if let Some(paths) = std::env::var_os("JUPYTER_PATH") {
            let mut env_dirs: Vec<PathBuf> = std::env::split_paths(&paths).collect();
            // JUPYTER_PATH lists its highest priority entry first
            env_dirs.reverse();
            data_dirs.extend(env_dirs);
        }

        if let Some(user_dir) = user_data_dir() {
            data_dirs.push(user_dir);
        }

        Self::with_kernel_dirs(data_dirs.into_iter().map(|d| d.join("kernels")).collect())
    }

    /// Search exactly the given `kernels` directories.
    pub fn with_kernel_dirs(kernel_dirs: Vec<PathBuf>) -> Self {
        Self { kernel_dirs }
    }

    /// Map each installed kernel name to its resource directory.
    pub fn find_kernel_specs(&self) -> HashMap<String, PathBuf> {
        let mut specs = HashMap::new();
        for kernel_dir in &self.kernel_dirs {
            let entries = match std::fs::read_dir(kernel_dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.join(KERNEL_FILE).is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !is_valid_kernel_name(name) {
                    log::debug!("Skipping kernel spec with invalid name '{}'", name);
                    continue;
                }
                specs.insert(name.to_lowercase(), path);
            }
        }
        specs
    }

    /// Every installed kernel spec, by name. Specs that cannot be read are
    /// skipped.
    pub fn all_specs(&self) -> HashMap<String, KernelSpec> {
        self.find_kernel_specs()
            .into_iter()
            .filter_map(|(name, dir)| match load_spec(&name, &dir) {
                Ok(spec) => Some((name, spec)),
                Err(err) => {
                    log::warn!("{}", err);
                    None
                }
            })
            .collect()
    }
}

impl KernelSpecProvider for KernelSpecManager {
    fn kernel_spec(&self, kernel_name: &str) -> Result<KernelSpec, KMError> {
        if !is_valid_kernel_name(kernel_name) {
            return Err(KMError::NoSuchKernel(kernel_name.to_string()));
        }
        let specs = self.find_kernel_specs();
        match specs.get(&kernel_name.to_lowercase()) {
            Some(dir) => load_spec(kernel_name, dir),
            None => Err(KMError::NoSuchKernel(kernel_name.to_string())),
        }
    }
}

fn load_spec(name: &str, resource_dir: &Path) -> Result<KernelSpec, KMError> {
    let json = std::fs::read_to_string(resource_dir.join(KERNEL_FILE))
        .map_err(|err| KMError::InvalidKernelSpec(name.to_string(), err.to_string()))?;
    let spec = KernelSpec::from_json(&json, resource_dir.to_path_buf())
        .map_err(|err| KMError::InvalidKernelSpec(name.to_string(), err.to_string()))?;
    if spec.argv.is_empty() {
        return Err(KMError::InvalidKernelSpec(
            name.to_string(),
            String::from("argv is empty"),
        ));
    }
    Ok(spec)
}

/// Kernel names are ASCII letters, digits, `.`, `-` and `_`.
pub fn is_valid_kernel_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// `JUPYTER_DATA_DIR`, or the platform's per-user data directory.
fn user_data_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("JUPYTER_DATA_DIR") {
        return Some(PathBuf::from(dir));
    }
    let base = directories::BaseDirs::new()?;
    #[cfg(target_os = "linux")]
    let dir = base.data_dir().join("jupyter");
    #[cfg(target_os = "macos")]
    let dir = base.home_dir().join("Library").join("Jupyter");
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    let dir = base.data_dir().join("jupyter");
    Some(dir)
}

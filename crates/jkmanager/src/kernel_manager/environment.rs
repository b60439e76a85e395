//
// environment.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Environment variable resolution for kernel processes.

use std::collections::HashMap;

/// Inherited variables that must not leak into a kernel. A Python host may
/// set `PYTHONEXECUTABLE`, which would make a Python kernel think it is that
/// host's interpreter.
const REMOVED_VARIABLES: &[&str] = &["PYTHONEXECUTABLE"];

/// Resolves environment variables for a kernel process.
///
/// Starts from the current process environment and merges in further
/// variable sets (the kernel spec's `env`, then any extra launch
/// environment). Merging never overwrites: the first value seen for a name
/// wins, so inherited values take precedence.
pub struct EnvironmentResolver {
    /// The base environment to start from
    initial_env: HashMap<String, String>,
}

impl Default for EnvironmentResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentResolver {
    /// Create a new environment resolver from the current process
    /// environment.
    pub fn new() -> Self {
        Self::with_initial_env(std::env::vars().collect())
    }

    /// Create a resolver from an explicit base environment.
    pub fn with_initial_env(env: HashMap<String, String>) -> Self {
        let initial_env = env
            .into_iter()
            .map(|(key, value)| (normalize_key(&key), value))
            .filter(|(key, _)| !REMOVED_VARIABLES.contains(&key.as_str()))
            .collect();
        Self { initial_env }
    }

    /// Resolve the environment by merging each layer in turn.
    pub fn resolve(&self, layers: &[&HashMap<String, String>]) -> HashMap<String, String> {
        let mut resolved_env = self.initial_env.clone();
        for layer in layers {
            for (key, value) in layer.iter() {
                let key = normalize_key(key);
                if resolved_env.contains_key(&key) {
                    log::trace!("Keeping inherited value of {}", key);
                    continue;
                }
                resolved_env.insert(key, value.clone());
            }
        }
        resolved_env
    }
}

// Environment variables are case-insensitive on Windows
#[cfg(target_os = "windows")]
fn normalize_key(key: &str) -> String {
    key.to_uppercase()
}

#[cfg(not(target_os = "windows"))]
fn normalize_key(key: &str) -> String {
    key.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn inherited_values_win() {
        let resolver = EnvironmentResolver::with_initial_env(env(&[("PATH", "/usr/bin")]));
        let resolved = resolver.resolve(&[&env(&[("PATH", "/opt/bin"), ("KERNEL_MODE", "1")])]);
        assert_eq!(resolved.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(resolved.get("KERNEL_MODE").map(String::as_str), Some("1"));
    }

    #[test]
    fn earlier_layers_win_over_later_ones() {
        let resolver = EnvironmentResolver::with_initial_env(HashMap::new());
        let resolved = resolver.resolve(&[&env(&[("A", "spec")]), &env(&[("A", "extra")])]);
        assert_eq!(resolved.get("A").map(String::as_str), Some("spec"));
    }

    #[test]
    fn python_executable_is_not_inherited() {
        let resolver = EnvironmentResolver::with_initial_env(env(&[
            ("PYTHONEXECUTABLE", "/host/python"),
            ("HOME", "/home/user"),
        ]));
        let resolved = resolver.resolve(&[]);
        assert!(!resolved.contains_key("PYTHONEXECUTABLE"));
        assert!(resolved.contains_key("HOME"));
    }
}

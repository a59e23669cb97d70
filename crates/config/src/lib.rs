//! Configuration loading for mailsweep
//!
//! Provides utilities for loading configuration files from the shared
//! mailsweep config directory (~/.config/mailsweep/), including layered
//! loading where a local override file is deep-merged over a base file.

use anyhow::{Context, Result};
use log::warn;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Name of the directory under the platform config dir
const APP_DIR: &str = "mailsweep";

/// Get the mailsweep config directory (~/.config/mailsweep/)
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load a base JSON file and deep-merge an optional local override on top.
///
/// - A missing base file yields an empty object, so callers fall back to
///   their serde defaults. A malformed base file is an error.
/// - A missing local file is ignored. A malformed local file is logged
///   and ignored, so a broken override never prevents a run.
pub fn load_layered<T: DeserializeOwned>(base: &Path, local: &Path) -> Result<T> {
    let mut merged = if base.exists() {
        load_json_file::<Value>(base)?
    } else {
        warn!("{} not found, using default configuration", base.display());
        Value::Object(Default::default())
    };

    if local.exists() {
        match load_json_file::<Value>(local) {
            Ok(overrides) => merge_json(&mut merged, overrides),
            Err(e) => warn!("Ignoring local config {}: {:#}", local.display(), e),
        }
    }

    serde_json::from_value(merged).context("Configuration does not match the expected layout")
}

/// Recursively merge `overrides` into `base`.
///
/// Objects are merged key by key; any other value replaces the base value.
pub fn merge_json(base: &mut Value, overrides: Value) {
    match (base, overrides) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

//! Subcommand implementations.

pub mod config;
pub mod sleep;
pub mod work;

use anyhow::Context;
use skein_engine::RuntimeConfig;
use std::path::Path;

/// Load the runtime configuration, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_toml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

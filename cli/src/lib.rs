pub mod defaults_cmd;
pub mod session_cmd;

use std::path::Path;

use anyhow::Context;
use dbg_bridge_core::Config;

/// Loads `path` when given, otherwise the config from the bridge home.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load_default().context("failed to load default config"),
    }
}

//! Config loading with CLI flag overrides applied on top.

use std::path::PathBuf;

use carelink_config::Config;
use tracing::debug;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// The file `--config` points at, or the platform default.
pub fn resolve_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(carelink_config::config_path)
}

pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = resolve_path(global);
    debug!(path = %path.display(), "loading config");

    let mut cfg = carelink_config::load_config_from(&path)?;
    if global.insecure {
        cfg.api.insecure = true;
    }
    Ok(cfg)
}

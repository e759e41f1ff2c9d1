use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory for node state: `~/.mesh/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".mesh"))
}

/// Returns the default config file path: `~/.mesh/config.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("config.json"))
}

/// Returns the default logs directory: `~/.mesh/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

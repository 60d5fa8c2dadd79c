//! Well-known directories: everything lives under `~/.scenemesh`.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.scenemesh`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".scenemesh"))
}

/// Returns the network config file path: `~/.scenemesh/network.json`
pub fn network_config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("network.json"))
}

/// Returns the logs directory: `~/.scenemesh/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}

/// Ensures all required directories exist.
pub fn ensure_dirs() -> Result<()> {
    for dir in [base_dir()?, logs_dir()?] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
    }
    Ok(())
}

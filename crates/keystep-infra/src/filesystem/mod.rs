//! Data directory layout for keystep.
//!
//! Everything the CLI persists lives under one data directory:
//! `config.toml`, the checkpoint database `keystep.db`, and `workflows/`.

use std::path::{Path, PathBuf};

use keystep_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "KEYSTEP_DATA_DIR";

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `KEYSTEP_DATA_DIR` environment variable
/// 2. `~/.keystep`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".keystep");
    }

    // Last resort: current directory
    PathBuf::from(".keystep")
}

/// Checkpoint database URL: the configured one, else `{data_dir}/keystep.db`.
pub fn database_url(data_dir: &Path, config: &EngineConfig) -> String {
    match &config.database_url {
        Some(url) => url.clone(),
        None => format!("sqlite://{}?mode=rwc", data_dir.join("keystep.db").display()),
    }
}

/// Workflow directory: the configured one, else `{data_dir}/workflows`.
pub fn workflows_dir(data_dir: &Path, config: &EngineConfig) -> PathBuf {
    config
        .workflows_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("workflows"))
}

/// Create the data directory if needed.
pub async fn ensure_data_dir(data_dir: &Path) -> Result<(), std::io::Error> {
    tokio::fs::create_dir_all(data_dir).await
}

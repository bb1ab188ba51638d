//! Engine configuration types for keystep.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data directory.
//! Every field has a default so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

/// Default per-attempt step timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Top-level configuration for the keystep engine and CLI.
///
/// Loaded from `~/.keystep/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on steps running at once within a level (None = level size).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,

    /// Timeout applied to each handler attempt when the step sets none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Checkpoint database URL. Defaults to `{data_dir}/keystep.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Directory scanned for workflow YAML files. Defaults to `{data_dir}/workflows`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<String>,
}

fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: None,
            default_step_timeout_secs: default_step_timeout_secs(),
            database_url: None,
            workflows_dir: None,
        }
    }
}

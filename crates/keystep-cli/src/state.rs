//! Application state wiring the engine together.
//!
//! The orchestrator is generic over its checkpoint store; AppState pins it to
//! the SQLite implementation from `keystep-infra`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use keystep_core::workflow::executor::Orchestrator;
use keystep_core::workflow::registry::HandlerRegistry;
use keystep_infra::config::load_engine_config;
use keystep_infra::filesystem::{database_url, ensure_data_dir, resolve_data_dir, workflows_dir};
use keystep_infra::sqlite::{DatabasePool, SqliteCheckpointStore};
use keystep_types::config::EngineConfig;

/// Orchestrator pinned to the durable store.
pub type ConcreteOrchestrator = Orchestrator<SqliteCheckpointStore>;

/// Shared application state for CLI commands.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConcreteOrchestrator>,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: load config, open the DB, register handlers.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url(&data_dir, &config);
        let db_pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open checkpoint database at {db_url}"))?;

        let orchestrator = Orchestrator::new(
            SqliteCheckpointStore::new(db_pool.clone()),
            HandlerRegistry::with_builtins(),
            config.clone(),
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            workflows_dir: workflows_dir(&data_dir, &config),
            config,
            data_dir,
            db_pool,
        })
    }

    /// The durable store behind the orchestrator.
    pub fn store(&self) -> &SqliteCheckpointStore {
        self.orchestrator.store()
    }
}

//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps a `CheckpointStore` with the operations the orchestrator needs,
//! mapping store failures into `CheckpointError` and logging every durable
//! transition. A step outcome is only considered final once
//! [`CheckpointManager::record_step`] returns `Ok`.

use keystep_types::error::RepositoryError;
use keystep_types::workflow::{RunStatus, StepCheckpoint, WorkflowRun};
use uuid::Uuid;

use crate::repository::workflow::{CheckpointStore, RunStatusUpdate};

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `R: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory).
pub struct CheckpointManager<R: CheckpointStore> {
    store: R,
}

impl<R: CheckpointStore> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given store.
    pub fn new(store: R) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &R {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a freshly started run.
    pub async fn create_run(&self, run: &WorkflowRun) -> Result<(), CheckpointError> {
        self.store
            .create_run(run)
            .await
            .map_err(CheckpointError::StoreWrite)?;

        tracing::debug!(
            run_id = %run.id,
            workflow = run.workflow_name.as_str(),
            "checkpointed run start"
        );
        Ok(())
    }

    /// Load a run, failing with `RunNotFound` when absent.
    pub async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.store
            .get_run(&run_id)
            .await
            .map_err(CheckpointError::StoreRead)?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Persist a run status transition.
    pub async fn update_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        update: &RunStatusUpdate,
    ) -> Result<(), CheckpointError> {
        self.store
            .update_run_status(&run_id, status, update)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => CheckpointError::RunNotFound(run_id),
                other => CheckpointError::StoreWrite(other),
            })?;

        tracing::debug!(run_id = %run_id, status = %status, "checkpointed run status");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Persist the terminal outcome of one step.
    pub async fn record_step(&self, checkpoint: &StepCheckpoint) -> Result<(), CheckpointError> {
        self.store
            .save_step_checkpoint(checkpoint)
            .await
            .map_err(CheckpointError::StoreWrite)?;

        tracing::debug!(
            run_id = %checkpoint.run_id,
            step = checkpoint.step_name.as_str(),
            status = %checkpoint.status,
            attempts = checkpoint.attempt_count,
            "checkpointed step"
        );
        Ok(())
    }

    /// Every checkpoint recorded for a run.
    pub async fn load_checkpoints(&self, run_id: Uuid) -> Result<Vec<StepCheckpoint>, CheckpointError> {
        self.store
            .list_step_checkpoints(&run_id)
            .await
            .map_err(CheckpointError::StoreRead)
    }

    /// Names of steps with a success checkpoint.
    pub async fn completed_steps(&self, run_id: Uuid) -> Result<Vec<String>, CheckpointError> {
        self.store
            .list_completed_steps(&run_id)
            .await
            .map_err(CheckpointError::StoreRead)
    }
}

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors from checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A durable write failed. Always fatal to the run.
    #[error("checkpoint write failed: {0}")]
    StoreWrite(#[source] RepositoryError),

    /// Reading durable state failed.
    #[error("checkpoint read failed: {0}")]
    StoreRead(#[source] RepositoryError),

    /// The run does not exist in the store.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Checkpoint store trait definition.
//!
//! Defines the storage interface for workflow runs and per-step checkpoints.
//! The infrastructure layer (keystep-infra) implements this trait with SQLite
//! persistence; [`super::memory::InMemoryCheckpointStore`] backs tests and
//! ephemeral runs.

use keystep_types::error::RepositoryError;
use keystep_types::workflow::{Outputs, RunStatus, StepCheckpoint, WorkflowRun};
use uuid::Uuid;

/// Fields written alongside a run status change.
///
/// Each field replaces the stored value, so a default update clears
/// `outputs`, `failed_step` and `error`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatusUpdate {
    pub outputs: Option<Outputs>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

/// Durable, transactional record of runs and step outcomes.
///
/// Implementations are cheap to clone and clones share one backend, so
/// several orchestrators may hold the same store.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a new run. Fails with `Conflict` if the id already exists.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by id.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Set a run's status and replace its outputs / failed step / error.
    ///
    /// Touches `updated_at`; sets `completed_at` for terminal statuses and
    /// clears it otherwise. Fails with `NotFound` for an unknown run.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        update: &RunStatusUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Runs of a workflow, newest first.
    fn list_runs(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Runs still marked `running` (the process driving them is gone or busy).
    fn list_interrupted_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step checkpoints
    // -----------------------------------------------------------------------

    /// Upsert a step checkpoint and touch the run's `updated_at`, atomically.
    ///
    /// Fails with `Conflict` if the step already has a success or skipped
    /// checkpoint and with `NotFound` if the run does not exist.
    fn save_step_checkpoint(
        &self,
        checkpoint: &StepCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Names of steps with a success checkpoint.
    fn list_completed_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Every checkpoint of a run, ordered by completion time.
    fn list_step_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepCheckpoint>, RepositoryError>> + Send;

    /// Number of checkpoints (any status) recorded for a run.
    fn count_step_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}

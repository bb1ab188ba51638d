//! In-memory [`CheckpointStore`] for tests and ephemeral runs.
//!
//! Clones share the same state, matching the sharing semantics of the SQLite
//! store. Each operation takes the lock once, so every write is atomic with
//! respect to concurrent readers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use keystep_types::error::RepositoryError;
use keystep_types::workflow::{RunStatus, StepCheckpoint, StepStatus, WorkflowRun};
use uuid::Uuid;

use super::workflow::{CheckpointStore, RunStatusUpdate};

#[derive(Debug, Default)]
struct State {
    runs: HashMap<Uuid, WorkflowRun>,
    checkpoints: HashMap<Uuid, HashMap<String, StepCheckpoint>>,
}

/// Process-local checkpoint store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if state.runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        update: &RunStatusUpdate,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        run.status = status;
        run.outputs = update.outputs.clone();
        run.failed_step = update.failed_step.clone();
        run.error = update.error.clone();
        run.updated_at = now;
        run.completed_at = status.is_terminal().then_some(now);
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_name: &str,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.lock();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| r.workflow_name == workflow_name)
            .cloned()
            .collect();
        // UUIDv7 ids sort by creation time.
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_interrupted_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let state = self.lock();
        let mut runs: Vec<WorkflowRun> = state
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(runs)
    }

    async fn save_step_checkpoint(&self, checkpoint: &StepCheckpoint) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let State { runs, checkpoints } = &mut *state;

        let run = runs
            .get_mut(&checkpoint.run_id)
            .ok_or(RepositoryError::NotFound)?;
        let steps = checkpoints.entry(checkpoint.run_id).or_default();
        if let Some(existing) = steps.get(&checkpoint.step_name) {
            if existing.status.is_final() {
                return Err(RepositoryError::Conflict(format!(
                    "step '{}' already has a final checkpoint",
                    checkpoint.step_name
                )));
            }
        }
        steps.insert(checkpoint.step_name.clone(), checkpoint.clone());
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn list_completed_steps(&self, run_id: &Uuid) -> Result<Vec<String>, RepositoryError> {
        let checkpoints = self.list_step_checkpoints(run_id).await?;
        Ok(checkpoints
            .into_iter()
            .filter(|c| c.status == StepStatus::Success)
            .map(|c| c.step_name)
            .collect())
    }

    async fn list_step_checkpoints(
        &self,
        run_id: &Uuid,
    ) -> Result<Vec<StepCheckpoint>, RepositoryError> {
        let state = self.lock();
        let mut checkpoints: Vec<StepCheckpoint> = state
            .checkpoints
            .get(run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default();
        checkpoints.sort_by(|a, b| {
            a.completed_at
                .cmp(&b.completed_at)
                .then_with(|| a.step_name.cmp(&b.step_name))
        });
        Ok(checkpoints)
    }

    async fn count_step_checkpoints(&self, run_id: &Uuid) -> Result<u64, RepositoryError> {
        Ok(self
            .lock()
            .checkpoints
            .get(run_id)
            .map_or(0, |steps| steps.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystep_types::workflow::{Outputs, WorkflowDefinition};
    use serde_json::json;

    fn definition(name: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            version: "1".to_string(),
            description: None,
            steps: vec![],
        }
    }

    fn checkpoint(run_id: Uuid, step: &str, status: StepStatus) -> StepCheckpoint {
        let now = Utc::now();
        let mut outputs = Outputs::new();
        outputs.insert("step".to_string(), json!(step));
        StepCheckpoint {
            run_id,
            step_name: step.to_string(),
            status,
            outputs,
            attempt_count: 1,
            started_at: now,
            completed_at: now,
            duration_ms: 0,
            metadata: Outputs::new(),
        }
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let store = InMemoryCheckpointStore::new();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        store.create_run(&run).await.unwrap();

        let loaded = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(store.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_run_conflicts() {
        let store = InMemoryCheckpointStore::new();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        store.create_run(&run).await.unwrap();
        assert!(matches!(
            store.create_run(&run).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn success_checkpoint_written_once() {
        let store = InMemoryCheckpointStore::new();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        store.create_run(&run).await.unwrap();

        store
            .save_step_checkpoint(&checkpoint(run.id, "a", StepStatus::Failed))
            .await
            .unwrap();
        // A failed checkpoint may be overwritten.
        store
            .save_step_checkpoint(&checkpoint(run.id, "a", StepStatus::Success))
            .await
            .unwrap();
        let err = store
            .save_step_checkpoint(&checkpoint(run.id, "a", StepStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        assert_eq!(store.count_step_checkpoints(&run.id).await.unwrap(), 1);
        assert_eq!(store.list_completed_steps(&run.id).await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn skipped_checkpoint_written_once() {
        let store = InMemoryCheckpointStore::new();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        store.create_run(&run).await.unwrap();

        store
            .save_step_checkpoint(&checkpoint(run.id, "a", StepStatus::Skipped))
            .await
            .unwrap();
        let err = store
            .save_step_checkpoint(&checkpoint(run.id, "a", StepStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        assert!(store.list_completed_steps(&run.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn checkpoint_for_unknown_run_is_not_found() {
        let store = InMemoryCheckpointStore::new();
        let err = store
            .save_step_checkpoint(&checkpoint(Uuid::now_v7(), "a", StepStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn update_status_sets_completion() {
        let store = InMemoryCheckpointStore::new();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        store.create_run(&run).await.unwrap();

        let update = RunStatusUpdate {
            failed_step: Some("x".to_string()),
            error: Some("boom".to_string()),
            ..Default::default()
        };
        store
            .update_run_status(&run.id, RunStatus::Failure, &update)
            .await
            .unwrap();
        let failed = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failure);
        assert_eq!(failed.failed_step.as_deref(), Some("x"));
        assert!(failed.completed_at.is_some());

        store
            .update_run_status(&run.id, RunStatus::Running, &RunStatusUpdate::default())
            .await
            .unwrap();
        let running = store.get_run(&run.id).await.unwrap().unwrap();
        assert!(running.failed_step.is_none());
        assert!(running.completed_at.is_none());

        assert!(matches!(
            store
                .update_run_status(&Uuid::now_v7(), RunStatus::Running, &update)
                .await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn history_queries() {
        let store = InMemoryCheckpointStore::new();
        let first = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        let second = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        let other = WorkflowRun::start(Uuid::now_v7(), &definition("other"), Outputs::new());
        for run in [&first, &second, &other] {
            store.create_run(run).await.unwrap();
        }
        store
            .update_run_status(&first.id, RunStatus::Success, &RunStatusUpdate::default())
            .await
            .unwrap();

        let runs = store.list_runs("wf", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(store.list_runs("wf", 1).await.unwrap().len(), 1);

        let interrupted = store.list_interrupted_runs().await.unwrap();
        let ids: Vec<Uuid> = interrupted.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&second.id) && ids.contains(&other.id));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = InMemoryCheckpointStore::new();
        let clone = store.clone();
        let run = WorkflowRun::start(Uuid::now_v7(), &definition("wf"), Outputs::new());
        clone.create_run(&run).await.unwrap();
        assert!(store.get_run(&run.id).await.unwrap().is_some());
    }
}

//! Workflow orchestrator: level-by-level execution with durable checkpointing.
//!
//! The `Orchestrator` processes an [`ExecutionPlan`] in level order. Pending
//! steps of a level run concurrently via `tokio::JoinSet`; each task owns its
//! step's retry loop and returns the step's terminal outcome. Once the whole
//! level has joined, the outcomes are checkpointed in definition order before
//! the next level may start.
//!
//! # Execution flow
//!
//! 1. Compile the definition and validate every handler config.
//! 2. Create a `WorkflowRun` record (or load the existing one for resume).
//! 3. For each level, spawn the steps without a success checkpoint.
//! 4. Join the level, checkpoint every outcome, extend the outputs map.
//! 5. Stop on a propagated failure, cancellation, or after the last level,
//!    and record the run's terminal status.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use keystep_types::config::EngineConfig;
use keystep_types::error::RepositoryError;
use keystep_types::event::EngineEvent;
use keystep_types::workflow::{
    Outputs, RunResult, RunStatus, StepCheckpoint, StepDefinition, StepStatus,
    WorkflowDefinition, WorkflowRun,
};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::{CheckpointStore, RunStatusUpdate};

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::dag::{ExecutionPlan, compile};
use super::definition::WorkflowError;
use super::handler::{
    ModelClient, ProgressSink, StepContext, StepError, StepHandlerDyn, StepProgress,
};
use super::registry::HandlerRegistry;
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a workflow definition.
    ///
    /// With `resume_from`, re-enters that run: steps with a success
    /// checkpoint are skipped and the persisted inputs are used. Otherwise a
    /// fresh run is created with `run_id` (or a new UUIDv7) and `inputs`.
    ///
    /// A step failure is a run outcome (`Ok` with status `failure`); `Err` is
    /// reserved for definition errors and store failures.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Outputs,
        run_id: Option<Uuid>,
        resume_from: Option<Uuid>,
    ) -> impl std::future::Future<Output = Result<RunResult, ExecutorError>> + Send;

    /// Request cooperative cancellation of an active run.
    ///
    /// Returns `false` if no run with that id is executing in this process.
    fn cancel(&self, run_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Level-based DAG orchestrator with durable checkpointing.
///
/// Generic over `R: CheckpointStore` for storage flexibility.
pub struct Orchestrator<R: CheckpointStore> {
    checkpoint: CheckpointManager<R>,
    registry: Arc<HandlerRegistry>,
    config: EngineConfig,
    event_bus: EventBus,
    model: Option<Arc<dyn ModelClient>>,
    /// Cancellation tokens keyed by run_id, present while the run executes.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: CheckpointStore> Orchestrator<R> {
    /// Create an orchestrator over `store` with the given handlers.
    pub fn new(store: R, registry: HandlerRegistry, config: EngineConfig) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store),
            registry: Arc::new(registry),
            config,
            event_bus: EventBus::default(),
            model: None,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Inject the model client handed to every step.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Publish lifecycle and progress events on `event_bus`.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &R {
        self.checkpoint.store()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Ids of runs currently executing in this process.
    pub fn active_runs(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.cancellation_tokens.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Register `run_id` as active, failing if it already is.
    fn activate(&self, run_id: Uuid) -> Result<ActiveRun<'_>, ExecutorError> {
        match self.cancellation_tokens.entry(run_id) {
            Entry::Occupied(_) => Err(ExecutorError::RunActive(run_id)),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                Ok(ActiveRun {
                    tokens: &self.cancellation_tokens,
                    run_id,
                    token,
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Run preparation
    // -----------------------------------------------------------------------

    async fn prepare_fresh(
        &self,
        definition: &WorkflowDefinition,
        inputs: Outputs,
        run_id: Uuid,
    ) -> Result<PreparedRun, ExecutorError> {
        let run = WorkflowRun::start(run_id, definition, inputs);
        self.checkpoint.create_run(&run).await.map_err(|e| match e {
            CheckpointError::StoreWrite(RepositoryError::Conflict(_)) => {
                ExecutorError::RunAlreadyExists(run_id)
            }
            other => ExecutorError::Checkpoint(other),
        })?;

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            "starting workflow execution"
        );

        Ok(PreparedRun {
            inputs: run.inputs,
            completed: HashSet::new(),
            outputs: HashMap::new(),
            previous: HashMap::new(),
        })
    }

    async fn prepare_resume(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
    ) -> Result<Resumption, ExecutorError> {
        let run = self.checkpoint.load_run(run_id).await?;
        if run.workflow_name != definition.name || run.workflow_version != definition.version {
            return Err(ExecutorError::DefinitionMismatch {
                run_id,
                expected: format!("{}@{}", run.workflow_name, run.workflow_version),
                found: format!("{}@{}", definition.name, definition.version),
            });
        }

        let checkpoints = self.checkpoint.load_checkpoints(run_id).await?;

        if run.status == RunStatus::Success {
            tracing::info!(run_id = %run_id, "run already succeeded, returning stored result");
            let outputs = run
                .outputs
                .unwrap_or_else(|| final_outputs(&checkpoint_outputs(&checkpoints)));
            return Ok(Resumption::Finished(RunResult {
                run_id,
                status: RunStatus::Success,
                outputs,
                failed_step: None,
                error: None,
            }));
        }

        let mut completed = HashSet::new();
        let mut outputs = HashMap::new();
        let mut previous = HashMap::new();
        for checkpoint in checkpoints {
            if checkpoint.status.is_final() {
                completed.insert(checkpoint.step_name.clone());
                outputs.insert(checkpoint.step_name.clone(), checkpoint.outputs);
            } else {
                previous.insert(checkpoint.step_name.clone(), checkpoint);
            }
        }

        self.checkpoint
            .update_run(run_id, RunStatus::Running, &RunStatusUpdate::default())
            .await?;

        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            skipping = completed.len(),
            "resuming workflow execution"
        );

        Ok(Resumption::Continue(PreparedRun {
            inputs: run.inputs,
            completed,
            outputs,
            previous,
        }))
    }

    // -----------------------------------------------------------------------
    // Level loop
    // -----------------------------------------------------------------------

    /// Drive the plan's levels. Mutates `prepared.outputs` as steps finish.
    async fn execute_levels(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        run_id: Uuid,
        prepared: &mut PreparedRun,
        cancel_token: &CancellationToken,
    ) -> Result<LevelsOutcome, ExecutorError> {
        let semaphore = self
            .config
            .max_parallel_steps
            .map(|max| Arc::new(Semaphore::new(max.max(1))));
        let progress: Arc<dyn ProgressSink> = Arc::new(self.event_bus.clone());

        for (level_idx, level) in plan.levels.iter().enumerate() {
            if cancel_token.is_cancelled() {
                return Ok(LevelsOutcome::Cancelled);
            }

            let pending: Vec<&StepDefinition> = level
                .iter()
                .filter(|name| !prepared.completed.contains(*name))
                .filter_map(|name| definition.step(name))
                .collect();
            if pending.is_empty() {
                tracing::debug!(run_id = %run_id, level = level_idx, "level already checkpointed");
                continue;
            }

            tracing::debug!(
                run_id = %run_id,
                level = level_idx,
                steps = pending.len(),
                "processing level"
            );
            self.event_bus.publish(EngineEvent::LevelStarted {
                run_id,
                level: level_idx,
                steps: pending.iter().map(|s| s.name.clone()).collect(),
            });

            let mut join_set = JoinSet::new();
            for step in &pending {
                let handler = self.registry.resolve(step)?;
                let mut ctx = StepContext {
                    run_id,
                    step_name: step.name.clone(),
                    attempt: 1,
                    inputs: prepared.inputs.clone(),
                    dependencies: step
                        .depends_on
                        .iter()
                        .map(|dep| {
                            (
                                dep.clone(),
                                prepared.outputs.get(dep).cloned().unwrap_or_default(),
                            )
                        })
                        .collect(),
                    config: step.config.clone(),
                    outputs: step.outputs.clone(),
                    previous: prepared.previous.get(&step.name).cloned(),
                    model: self.model.clone(),
                    progress: Arc::clone(&progress),
                };
                if ctx.previous.is_some() && !handler.can_resume(&ctx) {
                    tracing::debug!(
                        run_id = %run_id,
                        step = step.name.as_str(),
                        "handler cannot resume, voiding previous attempt"
                    );
                    ctx.previous = None;
                }

                let timeout = Duration::from_secs(
                    step.timeout_secs
                        .unwrap_or(self.config.default_step_timeout_secs),
                );
                let span = tracing::info_span!(
                    "step",
                    run_id = %run_id,
                    step = step.name.as_str(),
                    handler = step.handler.as_str()
                );
                join_set.spawn(
                    run_step(handler, (*step).clone(), ctx, timeout, semaphore.clone())
                        .instrument(span),
                );
            }

            // Join point: every step of the level reaches a terminal state.
            let mut finished: HashMap<String, StepCheckpoint> = HashMap::new();
            while let Some(joined) = join_set.join_next().await {
                let checkpoint = joined.map_err(|e| ExecutorError::Join(e.to_string()))?;
                finished.insert(checkpoint.step_name.clone(), checkpoint);
            }

            let mut failure: Option<(String, String)> = None;
            for step in &pending {
                let Some(checkpoint) = finished.remove(&step.name) else {
                    continue;
                };
                self.checkpoint.record_step(&checkpoint).await?;
                progress.step_finished(&StepProgress {
                    run_id,
                    step_name: checkpoint.step_name.clone(),
                    status: checkpoint.status,
                    duration_ms: checkpoint.duration_ms,
                    attempts: checkpoint.attempt_count,
                });

                match checkpoint.status {
                    StepStatus::Success | StepStatus::Skipped => {
                        prepared.completed.insert(checkpoint.step_name.clone());
                        prepared.previous.remove(&checkpoint.step_name);
                        prepared
                            .outputs
                            .insert(checkpoint.step_name, checkpoint.outputs);
                    }
                    StepStatus::Failed => {
                        if failure.is_none() {
                            let error = checkpoint
                                .metadata
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("step failed")
                                .to_string();
                            failure = Some((checkpoint.step_name, error));
                        }
                    }
                }
            }

            if let Some((step, error)) = failure {
                return Ok(LevelsOutcome::Failed { step, error });
            }
        }

        Ok(LevelsOutcome::Completed)
    }

    /// Record the run's terminal status and build the caller's result.
    async fn finish(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        outcome: LevelsOutcome,
        outputs: Outputs,
        started: Instant,
    ) -> Result<RunResult, ExecutorError> {
        let (status, update) = match &outcome {
            LevelsOutcome::Completed => (
                RunStatus::Success,
                RunStatusUpdate {
                    outputs: Some(outputs.clone()),
                    ..Default::default()
                },
            ),
            LevelsOutcome::Failed { step, error } => (
                RunStatus::Failure,
                RunStatusUpdate {
                    outputs: None,
                    failed_step: Some(step.clone()),
                    error: Some(error.clone()),
                },
            ),
            LevelsOutcome::Cancelled => (
                RunStatus::Cancelled,
                RunStatusUpdate {
                    error: Some("cancelled by request".to_string()),
                    ..Default::default()
                },
            ),
        };

        self.checkpoint.update_run(run_id, status, &update).await?;
        self.publish_finished(definition, run_id, status, update.failed_step.clone(), started);

        match status {
            RunStatus::Failure => tracing::warn!(
                run_id = %run_id,
                failed_step = update.failed_step.as_deref().unwrap_or_default(),
                "workflow run failed"
            ),
            _ => tracing::info!(run_id = %run_id, status = %status, "workflow run finished"),
        }

        Ok(RunResult {
            run_id,
            status,
            outputs,
            failed_step: update.failed_step,
            error: update.error,
        })
    }

    fn publish_finished(
        &self,
        definition: &WorkflowDefinition,
        run_id: Uuid,
        status: RunStatus,
        failed_step: Option<String>,
        started: Instant,
    ) {
        self.event_bus.publish(EngineEvent::RunFinished {
            run_id,
            workflow_name: definition.name.clone(),
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            failed_step,
        });
    }
}

impl<R: CheckpointStore> WorkflowExecutor for Orchestrator<R> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Outputs,
        run_id: Option<Uuid>,
        resume_from: Option<Uuid>,
    ) -> Result<RunResult, ExecutorError> {
        // Compile-time errors abort before any run record exists.
        let plan = compile(definition)?;
        self.registry.validate(definition)?;

        let resumed = resume_from.is_some();
        let run_id = match (resume_from, run_id) {
            (Some(resume), Some(requested)) if resume != requested => {
                tracing::warn!(
                    run_id = %requested,
                    resume_from = %resume,
                    "ignoring run id when resuming"
                );
                resume
            }
            (Some(resume), _) => resume,
            (None, requested) => requested.unwrap_or_else(Uuid::now_v7),
        };

        let active = self.activate(run_id)?;

        let mut prepared = if resumed {
            match self.prepare_resume(definition, run_id).await? {
                Resumption::Finished(result) => return Ok(result),
                Resumption::Continue(prepared) => prepared,
            }
        } else {
            self.prepare_fresh(definition, inputs, run_id).await?
        };

        self.event_bus.publish(EngineEvent::RunStarted {
            run_id,
            workflow_name: definition.name.clone(),
            resumed,
            skipped_steps: prepared.completed.len(),
        });

        let started = Instant::now();
        let outcome = self
            .execute_levels(definition, &plan, run_id, &mut prepared, &active.token)
            .await;

        // The run stays registered until its terminal status is persisted.
        let result = match outcome {
            Ok(outcome) => {
                let outputs = final_outputs(&prepared.outputs);
                self.finish(definition, run_id, outcome, outputs, started).await
            }
            Err(e) => {
                // Best effort: the store may be the thing that failed.
                let update = RunStatusUpdate {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
                if let Err(mark_err) = self
                    .checkpoint
                    .update_run(run_id, RunStatus::Failure, &update)
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %mark_err, "could not mark run as failed");
                }
                self.publish_finished(definition, run_id, RunStatus::Failure, None, started);
                tracing::error!(run_id = %run_id, error = %e, "workflow run aborted");
                Err(e)
            }
        };
        drop(active);
        result
    }

    fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-step task
// ---------------------------------------------------------------------------

/// Run one step's retry loop and produce its terminal checkpoint.
async fn run_step(
    handler: Arc<dyn StepHandlerDyn>,
    step: StepDefinition,
    mut ctx: StepContext,
    timeout: Duration,
    semaphore: Option<Arc<Semaphore>>,
) -> StepCheckpoint {
    let _permit = match semaphore {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };

    let started_at = Utc::now();
    let start = Instant::now();
    let mut attempt = 0;

    let outcome = loop {
        attempt += 1;
        ctx.attempt = attempt;

        let result = match tokio::time::timeout(
            timeout,
            AssertUnwindSafe(handler.execute_boxed(&ctx)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(StepError::ExecutionFailed("handler panicked".to_string())),
            Err(_elapsed) => Err(StepError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(result) => break Ok(result),
            Err(e) if RetryHandler::should_retry(&step.on_error, attempt) => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step = step.name.as_str(),
                    attempt,
                    error = %e,
                    "step attempt failed, retrying"
                );
                ctx.progress.step_retrying(ctx.run_id, &step.name, attempt, &e);
                if let Some(delay) = RetryHandler::backoff(&step.on_error) {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => break Err(e),
        }
    };

    let (status, outputs, metadata) = match outcome {
        Ok(result) => (StepStatus::Success, result.outputs, result.metadata),
        Err(e) => match RetryHandler::fallback(&step, &e) {
            Some((outputs, metadata)) => {
                tracing::warn!(
                    run_id = %ctx.run_id,
                    step = step.name.as_str(),
                    attempts = attempt,
                    error = %e,
                    "step failed, continuing with warnings"
                );
                (StepStatus::Skipped, outputs, metadata)
            }
            None => {
                let mut metadata = Outputs::new();
                metadata.insert("error".to_string(), Value::String(e.to_string()));
                (StepStatus::Failed, Outputs::new(), metadata)
            }
        },
    };

    StepCheckpoint {
        run_id: ctx.run_id,
        step_name: step.name,
        status,
        outputs,
        attempt_count: attempt,
        started_at,
        completed_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
        metadata,
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Transient mirror of durable state for one `execute()` call.
struct PreparedRun {
    inputs: Outputs,
    completed: HashSet<String>,
    outputs: HashMap<String, Outputs>,
    previous: HashMap<String, StepCheckpoint>,
}

enum Resumption {
    Finished(RunResult),
    Continue(PreparedRun),
}

enum LevelsOutcome {
    Completed,
    Failed { step: String, error: String },
    Cancelled,
}

/// Removes the run's cancellation token when the call ends, on every path.
struct ActiveRun<'a> {
    tokens: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
    token: CancellationToken,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.tokens.remove(&self.run_id);
    }
}

fn checkpoint_outputs(checkpoints: &[StepCheckpoint]) -> HashMap<String, Outputs> {
    checkpoints
        .iter()
        .filter(|c| c.status != StepStatus::Failed)
        .map(|c| (c.step_name.clone(), c.outputs.clone()))
        .collect()
}

fn final_outputs(outputs: &HashMap<String, Outputs>) -> Outputs {
    outputs
        .iter()
        .map(|(step, values)| (step.clone(), Value::Object(values.clone())))
        .collect()
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that can occur during workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Definition or compile-time error (graph, handlers, configs).
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Resume was requested with a definition other than the run's.
    #[error("run {run_id} belongs to '{expected}', not '{found}'")]
    DefinitionMismatch {
        run_id: Uuid,
        expected: String,
        found: String,
    },

    /// The run is already executing in this process.
    #[error("workflow run {0} is already executing")]
    RunActive(Uuid),

    /// A fresh run was requested with an id that already exists.
    #[error("workflow run {0} already exists")]
    RunAlreadyExists(Uuid),

    /// A step task could not be joined.
    #[error("step task failed to join: {0}")]
    Join(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

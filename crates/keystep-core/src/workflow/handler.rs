//! Step handler contract and the capabilities injected into handlers.
//!
//! Handlers implement [`StepHandler`] using native async fn in traits. Since
//! RPITIT traits are not object safe, the registry stores handlers behind the
//! [`StepHandlerDyn`] wrapper trait, which every `StepHandler` implements via
//! a blanket impl with boxed futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use keystep_types::workflow::{Outputs, StepCheckpoint, StepStatus};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Runtime failure of a single handler attempt. Subject to retry and fallback.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// The handler reported a failure.
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    /// The attempt exceeded its per-attempt timeout.
    #[error("step timed out after {0}s")]
    Timeout(u64),

    /// The handler needs a capability the orchestrator was not given.
    #[error("missing capability: {0}")]
    MissingCapability(String),
}

// ---------------------------------------------------------------------------
// Injected capabilities
// ---------------------------------------------------------------------------

/// Opaque language-model capability consumed by handlers.
///
/// Object safe so the orchestrator can hold any implementation as
/// `Arc<dyn ModelClient>` and pass it through to every step.
pub trait ModelClient: Send + Sync {
    fn complete<'a>(
        &'a self,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, StepError>> + Send + 'a>>;
}

/// Terminal outcome of one step, reported to a [`ProgressSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepProgress {
    pub run_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub attempts: u32,
}

/// Observer of step progress. Never influences scheduling.
pub trait ProgressSink: Send + Sync {
    /// Called once per step after it reaches a terminal state.
    fn step_finished(&self, progress: &StepProgress);

    /// Called when an attempt failed and another one follows.
    fn step_retrying(&self, _run_id: Uuid, _step_name: &str, _attempt: u32, _error: &StepError) {}
}

/// Sink that drops every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn step_finished(&self, _progress: &StepProgress) {}
}

// ---------------------------------------------------------------------------
// StepContext / StepResult
// ---------------------------------------------------------------------------

/// Everything a handler sees for one attempt of one step.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub step_name: String,
    /// 1-based attempt number within the current retry loop.
    pub attempt: u32,
    /// Inputs the run was created with.
    pub inputs: Outputs,
    /// Checkpointed outputs of each dependency, in declaration order.
    pub dependencies: Vec<(String, Outputs)>,
    /// This step's handler configuration.
    pub config: Outputs,
    /// Declared output names.
    pub outputs: Vec<String>,
    /// Previous failed checkpoint of this step, when the handler resumes.
    pub previous: Option<StepCheckpoint>,
    pub model: Option<Arc<dyn ModelClient>>,
    pub progress: Arc<dyn ProgressSink>,
}

impl StepContext {
    /// Outputs of the named dependency.
    pub fn dependency(&self, name: &str) -> Option<&Outputs> {
        self.dependencies
            .iter()
            .find(|(dep, _)| dep == name)
            .map(|(_, outputs)| outputs)
    }

    /// The injected model client, or `MissingCapability`.
    pub fn model(&self) -> Result<&dyn ModelClient, StepError> {
        self.model
            .as_deref()
            .ok_or_else(|| StepError::MissingCapability("model client".to_string()))
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step_name", &self.step_name)
            .field("attempt", &self.attempt)
            .field("dependencies", &self.dependencies.len())
            .field("has_previous", &self.previous.is_some())
            .field("has_model", &self.model.is_some())
            .finish_non_exhaustive()
    }
}

/// Value a handler returns on success. Promoted to a checkpoint by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub outputs: Outputs,
    pub metadata: Outputs,
}

impl StepResult {
    pub fn new(outputs: Outputs) -> Self {
        Self {
            outputs,
            metadata: Outputs::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// StepHandler
// ---------------------------------------------------------------------------

/// A step type: executes one attempt and validates its own configuration.
pub trait StepHandler: Send + Sync {
    /// Run one attempt of the step.
    fn execute(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send;

    /// Check a step's configuration before any step of the run executes.
    /// The error string is the reason reported to the user.
    fn validate_config(&self, _config: &Outputs) -> Result<(), String> {
        Ok(())
    }

    /// Whether a resumed step may see its previous failed checkpoint.
    /// Returning `false` voids the previous attempt.
    fn can_resume(&self, _ctx: &StepContext) -> bool {
        true
    }
}

/// Object-safe version of [`StepHandler`] with a boxed future.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;

    fn validate_config(&self, config: &Outputs) -> Result<(), String>;

    fn can_resume(&self, ctx: &StepContext) -> bool;
}

/// Blanket implementation: any `StepHandler` automatically implements `StepHandlerDyn`.
impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }

    fn validate_config(&self, config: &Outputs) -> Result<(), String> {
        StepHandler::validate_config(self, config)
    }

    fn can_resume(&self, ctx: &StepContext) -> bool {
        StepHandler::can_resume(self, ctx)
    }
}

//! Workflow domain types for keystep.
//!
//! Defines the canonical representation of a step graph (`WorkflowDefinition`)
//! together with the durable execution records the engine persists
//! (`WorkflowRun`, `StepCheckpoint`) and the value returned to callers
//! (`RunResult`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key/value mapping used for inputs, configuration, outputs and metadata.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A named, versioned graph of steps.
///
/// Produced by an authoring/loading collaborator (YAML files in practice) and
/// immutable once compiled into an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow name. Runs reference the definition by name and version.
    pub name: String,
    /// Version string (e.g. "1.0.0").
    pub version: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Steps in declaration order. Step names are unique within a workflow.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step by name.
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step name, unique within a workflow (e.g. "gather-news").
    pub name: String,
    /// Identifier of the registered handler that executes this step.
    pub handler: String,
    /// Names of steps that must finish before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Handler-specific configuration, validated by the handler at compile time.
    #[serde(default)]
    pub config: Outputs,
    /// Declared output names. Used to synthesize empty outputs on fallback.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Retry and fallback policy.
    #[serde(default)]
    pub on_error: ErrorPolicy,
    /// Per-attempt timeout in seconds (falls back to the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Error policy
// ---------------------------------------------------------------------------

/// What happens when a step's handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorPolicy {
    /// Additional attempts after the first failure (total attempts = retry + 1).
    #[serde(default)]
    pub retry: u32,
    /// Action once retries are exhausted.
    #[serde(default)]
    pub fallback: FallbackMode,
    /// Delay between attempts in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

/// Action taken once a step has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Propagate the failure: the run stops with status `failure`.
    #[default]
    Fail,
    /// Record the step as skipped with empty outputs and keep going.
    ContinueWithWarnings,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl RunStatus {
    /// Whether the run reached an end state (it may still be resumable).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    /// Storage representation (`"running"`, `"success"`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Terminal status of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Success and skipped checkpoints are final; a resume never re-enters them.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow Run (durable record)
// ---------------------------------------------------------------------------

/// One execution attempt of a workflow definition against a set of inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow definition being executed.
    pub workflow_name: String,
    /// Version of the workflow definition being executed.
    pub workflow_version: String,
    /// Current run status.
    pub status: RunStatus,
    /// Input bindings supplied when the run was created.
    #[serde(default)]
    pub inputs: Outputs,
    /// Final outputs (step name -> step outputs), set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,
    /// Step whose terminal failure stopped the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    /// Error message for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Touched by every checkpoint write.
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// A fresh run record in `running` status.
    pub fn start(id: Uuid, definition: &WorkflowDefinition, inputs: Outputs) -> Self {
        let now = Utc::now();
        Self {
            id,
            workflow_name: definition.name.clone(),
            workflow_version: definition.version.clone(),
            status: RunStatus::Running,
            inputs,
            outputs: None,
            failed_step: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Step Checkpoint (durable record)
// ---------------------------------------------------------------------------

/// Durable terminal outcome of one step in one run, keyed by `(run_id, step_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub run_id: Uuid,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(default)]
    pub outputs: Outputs,
    /// Number of handler invocations in the retry loop that produced this outcome.
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Free-form annotations (`warning`, `error`, handler metadata).
    #[serde(default)]
    pub metadata: Outputs,
}

// ---------------------------------------------------------------------------
// Run result
// ---------------------------------------------------------------------------

/// Value returned by the engine's `execute` entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Step name -> outputs for every non-failed step known to the run.
    pub outputs: Outputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_definition_yaml_defaults() {
        let yaml = r#"
name: gather
handler: echo
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.name, "gather");
        assert!(step.depends_on.is_empty());
        assert!(step.config.is_empty());
        assert_eq!(step.on_error.retry, 0);
        assert_eq!(step.on_error.fallback, FallbackMode::Fail);
        assert!(step.timeout_secs.is_none());
    }

    #[test]
    fn test_error_policy_yaml() {
        let yaml = r#"
retry: 2
fallback: continue_with_warnings
backoff_ms: 50
"#;
        let policy: ErrorPolicy = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(policy.retry, 2);
        assert_eq!(policy.fallback, FallbackMode::ContinueWithWarnings);
        assert_eq!(policy.backoff_ms, Some(50));
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let yaml = "fallback: ignore";
        assert!(serde_yaml_ng::from_str::<ErrorPolicy>(yaml).is_err());
    }

    #[test]
    fn test_run_status_string_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failure,
            RunStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert!("crashed".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Failure.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_step_status_parse() {
        assert_eq!("skipped".parse::<StepStatus>().unwrap(), StepStatus::Skipped);
        assert!("running".parse::<StepStatus>().is_err());
    }

    #[test]
    fn test_workflow_run_start() {
        let def = WorkflowDefinition {
            name: "digest".to_string(),
            version: "2.1.0".to_string(),
            description: None,
            steps: vec![],
        };
        let mut inputs = Outputs::new();
        inputs.insert("topic".to_string(), json!("rust"));

        let run = WorkflowRun::start(Uuid::now_v7(), &def, inputs);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.workflow_name, "digest");
        assert_eq!(run.workflow_version, "2.1.0");
        assert_eq!(run.inputs["topic"], json!("rust"));
        assert_eq!(run.created_at, run.updated_at);
        assert!(run.completed_at.is_none());
    }

    #[test]
    fn test_definition_step_lookup() {
        let yaml = r#"
name: wf
version: "1"
steps:
  - name: a
    handler: echo
  - name: b
    handler: merge
    depends_on: [a]
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.step("b").unwrap().depends_on, vec!["a"]);
        assert!(def.step("zzz").is_none());
    }
}

//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Parses YAML files into the canonical `WorkflowDefinition`,
//! validates structural constraints (non-empty name, at least one step, unique
//! step names), and provides discovery for workflow files on disk. Graph
//! constraints (dependencies, cycles) are checked by [`super::dag::compile`].

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use keystep_types::workflow::WorkflowDefinition;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Definition and compile-time errors. Fatal to a run and never retried.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Dependency graph contains a cycle.
    #[error("cycle detected involving steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    /// A step references a step that does not exist.
    #[error("unknown dependency: step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// Two steps share the same name.
    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    /// A step references a handler identifier nobody registered.
    #[error("step '{step}' uses unregistered handler '{handler}'")]
    UnknownHandler { step: String, handler: String },

    /// A handler rejected a step's configuration.
    #[error("invalid config for step '{step}': {reason}")]
    ConfigValidation { step: String, reason: String },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a structurally valid `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty
/// - At least one step exists
/// - Step names are non-empty and unique
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.name.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step name must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(WorkflowError::DuplicateStep(step.name.clone()));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively, visiting entries in path
/// order. Files that fail to parse are skipped with a warning. When two files
/// declare the same workflow name, the first one found wins and the duplicate
/// is skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;

    let mut first_seen: HashMap<String, PathBuf> = HashMap::new();
    results.retain(|(path, def)| match first_seen.get(&def.name) {
        Some(existing) => {
            tracing::warn!(
                workflow = def.name.as_str(),
                first = %existing.display(),
                duplicate = %path.display(),
                "skipping duplicate workflow name"
            );
            false
        }
        None => {
            first_seen.insert(def.name.clone(), path.clone());
            true
        }
    });

    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(def) => results.push((path, def)),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

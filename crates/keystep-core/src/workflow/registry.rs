//! Handler registry: identifier -> step handler.
//!
//! Populated once at process start and shared read-only by the orchestrator.
//! Resolution fails fast with `UnknownHandler`; `validate` runs every step's
//! config through its handler before a run record is created.

use std::collections::HashMap;
use std::sync::Arc;

use keystep_types::workflow::{StepDefinition, WorkflowDefinition};

use super::builtin::{DelayHandler, EchoHandler, MergeHandler, PromptHandler};
use super::definition::WorkflowError;
use super::handler::{StepHandler, StepHandlerDyn};

/// Registry of step handlers keyed by identifier.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandlerDyn>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `echo`, `merge`, `delay` and `prompt` registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", EchoHandler);
        registry.register("merge", MergeHandler);
        registry.register("delay", DelayHandler);
        registry.register("prompt", PromptHandler);
        registry
    }

    /// Register `handler` under `id`, replacing any previous registration.
    pub fn register<H: StepHandler + 'static>(&mut self, id: impl Into<String>, handler: H) {
        let id = id.into();
        if self.handlers.insert(id.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(handler = id.as_str(), "replaced step handler");
        }
    }

    /// Look up a handler by identifier.
    pub fn get(&self, id: &str) -> Option<Arc<dyn StepHandlerDyn>> {
        self.handlers.get(id).cloned()
    }

    /// Resolve the handler a step references.
    pub fn resolve(&self, step: &StepDefinition) -> Result<Arc<dyn StepHandlerDyn>, WorkflowError> {
        self.get(&step.handler)
            .ok_or_else(|| WorkflowError::UnknownHandler {
                step: step.name.clone(),
                handler: step.handler.clone(),
            })
    }

    /// Check that every step's handler exists and accepts its config.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        for step in &definition.steps {
            let handler = self.resolve(step)?;
            handler
                .validate_config(&step.config)
                .map_err(|reason| WorkflowError::ConfigValidation {
                    step: step.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Registered identifiers, sorted.
    pub fn handler_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handler_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystep_types::workflow::{ErrorPolicy, Outputs};
    use serde_json::json;

    fn step(name: &str, handler: &str, config: serde_json::Value) -> StepDefinition {
        StepDefinition {
            name: name.to_string(),
            handler: handler.to_string(),
            depends_on: vec![],
            config: match config {
                serde_json::Value::Object(map) => map,
                _ => Outputs::new(),
            },
            outputs: vec![],
            on_error: ErrorPolicy::default(),
            timeout_secs: None,
        }
    }

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".to_string(),
            version: "1".to_string(),
            description: None,
            steps,
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        assert_eq!(registry.handler_ids(), vec!["delay", "echo", "merge", "prompt"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("shell").is_none());
    }

    #[test]
    fn unknown_handler_fails_fast() {
        let registry = HandlerRegistry::with_builtins();
        let def = workflow(vec![step("a", "echo", json!({})), step("b", "shell", json!({}))]);
        match registry.validate(&def).unwrap_err() {
            WorkflowError::UnknownHandler { step, handler } => {
                assert_eq!(step, "b");
                assert_eq!(handler, "shell");
            }
            other => panic!("expected unknown handler, got {other}"),
        }
    }

    #[test]
    fn invalid_config_is_reported_with_step() {
        let registry = HandlerRegistry::with_builtins();
        let def = workflow(vec![step("wait", "delay", json!({"ms": "soon"}))]);
        let err = registry.validate(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::ConfigValidation { ref step, .. } if step == "wait"));
        assert!(err.to_string().contains("non-negative integer"));
    }

    #[test]
    fn valid_definition_passes() {
        let registry = HandlerRegistry::with_builtins();
        let def = workflow(vec![
            step("a", "echo", json!({"values": {"k": "v"}})),
            step("b", "delay", json!({"ms": 1})),
            step("c", "prompt", json!({"template": "hi {{inputs.name}}"})),
        ]);
        assert!(registry.validate(&def).is_ok());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HandlerRegistry::new();
        registry.register("x", EchoHandler);
        registry.register("x", MergeHandler);
        assert_eq!(registry.handler_ids(), vec!["x"]);
    }
}

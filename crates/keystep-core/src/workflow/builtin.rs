//! Built-in step handlers registered by [`super::registry::HandlerRegistry::with_builtins`].
//!
//! - `echo`: outputs `config.values`
//! - `merge`: unions the outputs of every dependency
//! - `delay`: sleeps `config.ms` milliseconds
//! - `prompt`: renders `config.template` and sends it to the model client

use std::sync::LazyLock;
use std::time::Duration;

use keystep_types::workflow::Outputs;
use regex::Regex;
use serde_json::{Value, json};

use super::handler::{StepContext, StepError, StepHandler, StepResult};

// ---------------------------------------------------------------------------
// echo
// ---------------------------------------------------------------------------

/// Outputs the `values` object from its config unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let outputs = match ctx.config.get("values") {
            Some(Value::Object(values)) => values.clone(),
            _ => Outputs::new(),
        };
        Ok(StepResult::new(outputs))
    }

    fn validate_config(&self, config: &Outputs) -> Result<(), String> {
        match config.get("values") {
            None | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err("'values' must be a mapping".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// merge
// ---------------------------------------------------------------------------

/// Unions the outputs of all dependencies.
///
/// Later dependencies (in declaration order) win on key collisions. With
/// `namespaced: true` each dependency's outputs are nested under its name
/// instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeHandler;

impl StepHandler for MergeHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let namespaced = ctx
            .config
            .get("namespaced")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut merged = Outputs::new();
        for (name, outputs) in &ctx.dependencies {
            if namespaced {
                merged.insert(name.clone(), Value::Object(outputs.clone()));
            } else {
                merged.extend(outputs.clone());
            }
        }
        Ok(StepResult::new(merged).with_metadata("sources", json!(ctx.dependencies.len())))
    }

    fn validate_config(&self, config: &Outputs) -> Result<(), String> {
        match config.get("namespaced") {
            None | Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err("'namespaced' must be a boolean".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// delay
// ---------------------------------------------------------------------------

/// Sleeps for `config.ms` milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayHandler;

impl StepHandler for DelayHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let ms = ctx
            .config
            .get("ms")
            .and_then(Value::as_u64)
            .ok_or_else(|| StepError::ExecutionFailed("'ms' is not set".to_string()))?;
        tokio::time::sleep(Duration::from_millis(ms)).await;

        let mut outputs = Outputs::new();
        outputs.insert("slept_ms".to_string(), json!(ms));
        Ok(StepResult::new(outputs))
    }

    fn validate_config(&self, config: &Outputs) -> Result<(), String> {
        match config.get("ms") {
            Some(v) if v.is_u64() => Ok(()),
            Some(_) => Err("'ms' must be a non-negative integer".to_string()),
            None => Err("'ms' is required".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// prompt
// ---------------------------------------------------------------------------

/// Renders `config.template` and sends it to the injected model client.
///
/// Placeholders: `{{inputs.KEY}}` reads a run input, `{{steps.STEP.KEY}}`
/// reads an output of a dependency. Outputs `{"text": <response>}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptHandler;

impl StepHandler for PromptHandler {
    async fn execute(&self, ctx: &StepContext) -> Result<StepResult, StepError> {
        let template = ctx
            .config
            .get("template")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::ExecutionFailed("'template' is not set".to_string()))?;
        let prompt = render_template(template, ctx)?;
        let model = ctx.model()?;
        let text = model.complete(&prompt).await?;

        let mut outputs = Outputs::new();
        outputs.insert("text".to_string(), Value::String(text));
        Ok(StepResult::new(outputs).with_metadata("prompt_chars", json!(prompt.chars().count())))
    }

    fn validate_config(&self, config: &Outputs) -> Result<(), String> {
        match config.get("template") {
            Some(Value::String(t)) if !t.trim().is_empty() => Ok(()),
            Some(Value::String(_)) => Err("'template' must not be empty".to_string()),
            Some(_) => Err("'template' must be a string".to_string()),
            None => Err("'template' is required".to_string()),
        }
    }
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder regex should compile"));

/// Substitute `{{inputs.KEY}}` and `{{steps.STEP.KEY}}` placeholders.
///
/// String values are inserted verbatim, anything else as compact JSON. An
/// unresolvable or unterminated placeholder fails the attempt.
pub fn render_template(template: &str, ctx: &StepContext) -> Result<String, StepError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        push_literal(&mut rendered, &template[last..whole.start()])?;
        rendered.push_str(&resolve_placeholder(expr.as_str(), ctx)?);
        last = whole.end();
    }
    push_literal(&mut rendered, &template[last..])?;
    Ok(rendered)
}

fn push_literal(rendered: &mut String, literal: &str) -> Result<(), StepError> {
    if literal.contains("{{") {
        return Err(StepError::ExecutionFailed(
            "unterminated '{{' in template".to_string(),
        ));
    }
    rendered.push_str(literal);
    Ok(())
}

fn resolve_placeholder(expr: &str, ctx: &StepContext) -> Result<String, StepError> {
    let unresolved = || StepError::ExecutionFailed(format!("unresolved placeholder '{{{{{expr}}}}}'"));

    let value = match expr.split('.').collect::<Vec<_>>().as_slice() {
        ["inputs", key] => ctx.inputs.get(*key),
        ["steps", step, key] => ctx.dependency(step).and_then(|o| o.get(*key)),
        _ => None,
    }
    .ok_or_else(unresolved)?;

    Ok(match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    use super::*;
    use crate::workflow::handler::{ModelClient, NoopProgress};
    use uuid::Uuid;

    struct Reverse;

    impl ModelClient for Reverse {
        fn complete<'a>(
            &'a self,
            prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<String, StepError>> + Send + 'a>> {
            Box::pin(async move { Ok(prompt.chars().rev().collect()) })
        }
    }

    fn obj(value: Value) -> Outputs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn ctx(config: Value) -> StepContext {
        StepContext {
            run_id: Uuid::now_v7(),
            step_name: "s".to_string(),
            attempt: 1,
            inputs: obj(json!({"topic": "rust", "n": 3})),
            dependencies: vec![
                ("a".to_string(), obj(json!({"x": 1, "shared": "from-a"}))),
                ("b".to_string(), obj(json!({"y": 2, "shared": "from-b"}))),
            ],
            config: obj(config),
            outputs: vec![],
            previous: None,
            model: None,
            progress: Arc::new(NoopProgress),
        }
    }

    #[tokio::test]
    async fn echo_outputs_values() {
        let result = EchoHandler
            .execute(&ctx(json!({"values": {"greeting": "hi"}})))
            .await
            .unwrap();
        assert_eq!(result.outputs, obj(json!({"greeting": "hi"})));
    }

    #[test]
    fn echo_rejects_non_mapping_values() {
        assert!(StepHandler::validate_config(&EchoHandler, &obj(json!({"values": 3}))).is_err());
        assert!(StepHandler::validate_config(&EchoHandler, &Outputs::new()).is_ok());
    }

    #[tokio::test]
    async fn merge_later_dependency_wins() {
        let result = MergeHandler.execute(&ctx(json!({}))).await.unwrap();
        assert_eq!(
            result.outputs,
            obj(json!({"x": 1, "y": 2, "shared": "from-b"}))
        );
        assert_eq!(result.metadata["sources"], json!(2));
    }

    #[tokio::test]
    async fn merge_namespaced() {
        let result = MergeHandler
            .execute(&ctx(json!({"namespaced": true})))
            .await
            .unwrap();
        assert_eq!(result.outputs["a"]["shared"], json!("from-a"));
        assert_eq!(result.outputs["b"]["y"], json!(2));
    }

    #[tokio::test]
    async fn delay_sleeps_and_reports() {
        let result = DelayHandler.execute(&ctx(json!({"ms": 5}))).await.unwrap();
        assert_eq!(result.outputs["slept_ms"], json!(5));
    }

    #[test]
    fn delay_requires_ms() {
        assert!(StepHandler::validate_config(&DelayHandler, &Outputs::new()).is_err());
        assert!(StepHandler::validate_config(&DelayHandler, &obj(json!({"ms": -1}))).is_err());
        assert!(StepHandler::validate_config(&DelayHandler, &obj(json!({"ms": 10}))).is_ok());
    }

    #[test]
    fn render_template_substitutes_placeholders() {
        let c = ctx(json!({}));
        let out = render_template("topic={{inputs.topic}} n={{ inputs.n }} a={{steps.a.shared}}", &c)
            .unwrap();
        assert_eq!(out, "topic=rust n=3 a=from-a");
    }

    #[test]
    fn render_template_rejects_unknown_placeholder() {
        let c = ctx(json!({}));
        assert!(render_template("{{inputs.missing}}", &c).is_err());
        assert!(render_template("{{steps.zzz.x}}", &c).is_err());
        assert!(render_template("{{inputs.topic", &c).is_err());
        assert!(render_template("{{steps.a}}", &c).is_err());
    }

    #[test]
    fn render_template_passes_through_plain_text() {
        let c = ctx(json!({}));
        assert_eq!(render_template("no placeholders }", &c).unwrap(), "no placeholders }");
        assert_eq!(render_template("{{inputs.n}}{{inputs.n}}", &c).unwrap(), "33");
    }

    #[tokio::test]
    async fn prompt_uses_model_client() {
        let mut c = ctx(json!({"template": "{{inputs.topic}}!"}));
        c.model = Some(Arc::new(Reverse));
        let result = PromptHandler.execute(&c).await.unwrap();
        assert_eq!(result.outputs["text"], json!("!tsur"));
    }

    #[tokio::test]
    async fn prompt_without_model_is_missing_capability() {
        let c = ctx(json!({"template": "hello"}));
        let err = PromptHandler.execute(&c).await.unwrap_err();
        assert!(matches!(err, StepError::MissingCapability(_)));
    }
}

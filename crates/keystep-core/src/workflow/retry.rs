//! Retry and fallback decisions for failed steps.
//!
//! Stateless: every decision is a function of the step's `ErrorPolicy` and the
//! attempt counter. The orchestrator owns the loop.

use std::time::Duration;

use keystep_types::workflow::{ErrorPolicy, FallbackMode, Outputs, StepDefinition};
use serde_json::Value;

use super::handler::StepError;

/// Stateless retry handler for workflow step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Total invocations allowed by the policy (`retry + 1`).
    pub fn max_attempts(policy: &ErrorPolicy) -> u32 {
        policy.retry.saturating_add(1)
    }

    /// Whether another attempt follows a failed `attempt` (1-based).
    pub fn should_retry(policy: &ErrorPolicy, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Delay before the next attempt, if any.
    pub fn backoff(policy: &ErrorPolicy) -> Option<Duration> {
        policy
            .backoff_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Outputs and metadata for a step whose retries are exhausted, or `None`
    /// when the failure must propagate.
    pub fn fallback(step: &StepDefinition, last_error: &StepError) -> Option<(Outputs, Outputs)> {
        match step.on_error.fallback {
            FallbackMode::Fail => None,
            FallbackMode::ContinueWithWarnings => {
                let outputs = Self::skipped_outputs(step);
                let mut metadata = Outputs::new();
                metadata.insert("error".to_string(), Value::String(last_error.to_string()));
                metadata.insert(
                    "warning".to_string(),
                    Value::String(format!(
                        "step '{}' skipped after {} attempt(s); continuing with empty outputs",
                        step.name,
                        Self::max_attempts(&step.on_error)
                    )),
                );
                Some((outputs, metadata))
            }
        }
    }

    /// An empty mapping for every declared output name.
    pub fn skipped_outputs(step: &StepDefinition) -> Outputs {
        step.outputs
            .iter()
            .map(|name| (name.clone(), Value::Object(Outputs::new())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_with(policy: ErrorPolicy, outputs: Vec<&str>) -> StepDefinition {
        StepDefinition {
            name: "validate".to_string(),
            handler: "echo".to_string(),
            depends_on: vec![],
            config: Outputs::new(),
            outputs: outputs.into_iter().map(String::from).collect(),
            on_error: policy,
            timeout_secs: None,
        }
    }

    #[test]
    fn no_retry_by_default() {
        let policy = ErrorPolicy::default();
        assert_eq!(RetryHandler::max_attempts(&policy), 1);
        assert!(!RetryHandler::should_retry(&policy, 1));
    }

    #[test]
    fn retry_two_allows_three_attempts() {
        let policy = ErrorPolicy {
            retry: 2,
            ..Default::default()
        };
        assert!(RetryHandler::should_retry(&policy, 1));
        assert!(RetryHandler::should_retry(&policy, 2));
        assert!(!RetryHandler::should_retry(&policy, 3));
    }

    #[test]
    fn max_attempts_saturates() {
        let policy = ErrorPolicy {
            retry: u32::MAX,
            ..Default::default()
        };
        assert_eq!(RetryHandler::max_attempts(&policy), u32::MAX);
    }

    #[test]
    fn backoff_only_when_positive() {
        let mut policy = ErrorPolicy::default();
        assert!(RetryHandler::backoff(&policy).is_none());
        policy.backoff_ms = Some(0);
        assert!(RetryHandler::backoff(&policy).is_none());
        policy.backoff_ms = Some(25);
        assert_eq!(RetryHandler::backoff(&policy), Some(Duration::from_millis(25)));
    }

    #[test]
    fn fail_policy_propagates() {
        let step = step_with(ErrorPolicy::default(), vec!["report"]);
        let err = StepError::ExecutionFailed("boom".to_string());
        assert!(RetryHandler::fallback(&step, &err).is_none());
    }

    #[test]
    fn continue_with_warnings_synthesizes_empty_outputs() {
        let step = step_with(
            ErrorPolicy {
                retry: 2,
                fallback: FallbackMode::ContinueWithWarnings,
                backoff_ms: None,
            },
            vec!["report", "score"],
        );
        let err = StepError::ExecutionFailed("boom".to_string());
        let (outputs, metadata) = RetryHandler::fallback(&step, &err).unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs["report"], json!({}));
        assert_eq!(outputs["score"], json!({}));
        assert!(metadata["error"].as_str().unwrap().contains("boom"));
        assert!(metadata["warning"].as_str().unwrap().contains("3 attempt(s)"));
    }
}

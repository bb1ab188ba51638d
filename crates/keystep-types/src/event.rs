//! Event types for the keystep engine event bus.
//!
//! `EngineEvent` is the unified event type broadcast while a run executes.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.
//! Events are observations only; nothing in scheduling depends on them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{RunStatus, StepStatus};

/// Events emitted during workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run started (fresh) or was re-entered (resume).
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
        /// Steps already checkpointed successfully before this call.
        skipped_steps: usize,
    },

    /// A level of the execution plan is about to run.
    LevelStarted {
        run_id: Uuid,
        level: usize,
        steps: Vec<String>,
    },

    /// A step reached its terminal state and was checkpointed.
    StepFinished {
        run_id: Uuid,
        step_name: String,
        status: StepStatus,
        duration_ms: u64,
        attempts: u32,
    },

    /// A step attempt failed and will be retried.
    StepRetrying {
        run_id: Uuid,
        step_name: String,
        attempt: u32,
        error: String,
    },

    /// The run reached a terminal status.
    RunFinished {
        run_id: Uuid,
        workflow_name: String,
        status: RunStatus,
        duration_ms: u64,
        failed_step: Option<String>,
    },
}

impl EngineEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            EngineEvent::RunStarted { run_id, .. }
            | EngineEvent::LevelStarted { run_id, .. }
            | EngineEvent::StepFinished { run_id, .. }
            | EngineEvent::StepRetrying { run_id, .. }
            | EngineEvent::RunFinished { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = EngineEvent::StepFinished {
            run_id: Uuid::nil(),
            step_name: "gather".to_string(),
            status: StepStatus::Skipped,
            duration_ms: 12,
            attempts: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_finished");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["attempts"], 3);
    }

    #[test]
    fn test_event_run_id() {
        let id = Uuid::now_v7();
        let event = EngineEvent::LevelStarted {
            run_id: id,
            level: 1,
            steps: vec!["b".to_string(), "c".to_string()],
        };
        assert_eq!(event.run_id(), id);
    }
}

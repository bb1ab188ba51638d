//! Broadcast event bus for distributing `EngineEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`, the `EventBus` supports multiple
//! concurrent subscribers. Publishing with no active subscribers is a no-op.
//! The bus doubles as the orchestrator's [`ProgressSink`].

use keystep_types::event::EngineEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::workflow::handler::{ProgressSink, StepError, StepProgress};

/// Multi-consumer bus for run lifecycle and step progress events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

impl ProgressSink for EventBus {
    fn step_finished(&self, progress: &StepProgress) {
        self.publish(EngineEvent::StepFinished {
            run_id: progress.run_id,
            step_name: progress.step_name.clone(),
            status: progress.status,
            duration_ms: progress.duration_ms,
            attempts: progress.attempts,
        });
    }

    fn step_retrying(&self, run_id: Uuid, step_name: &str, attempt: u32, error: &StepError) {
        self.publish(EngineEvent::StepRetrying {
            run_id,
            step_name: step_name.to_string(),
            attempt,
            error: error.to_string(),
        });
    }
}

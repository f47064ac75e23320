//! Per-run notification topics over tokio broadcast channels.
//!
//! The engine publishes exactly one event per committed state transition,
//! strictly after the store transaction commits. Delivery is best-effort
//! at-least-once: a subscriber that lags past the channel capacity observes
//! a gap and must recover by re-fetching a snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state::SkipReason;

/// Default per-topic buffer; lagging subscribers beyond this resync.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "run:started")]
    RunStarted,
    #[serde(rename = "run:completed")]
    RunCompleted,
    #[serde(rename = "run:failed")]
    RunFailed,
    #[serde(rename = "step:started")]
    StepStarted,
    #[serde(rename = "step:completed")]
    StepCompleted,
    #[serde(rename = "step:failed")]
    StepFailed,
    #[serde(rename = "step:skipped")]
    StepSkipped,
}

impl EventKind {
    pub fn is_run_event(self) -> bool {
        matches!(self, Self::RunStarted | Self::RunCompleted | Self::RunFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run:started",
            Self::RunCompleted => "run:completed",
            Self::RunFailed => "run:failed",
            Self::StepStarted => "step:started",
            Self::StepCompleted => "step:completed",
            Self::StepFailed => "step:failed",
            Self::StepSkipped => "step:skipped",
        }
    }

    /// The status carried by this transition, as persisted.
    pub fn status_str(self) -> &'static str {
        match self {
            Self::RunStarted | Self::StepStarted => "started",
            Self::RunCompleted | Self::StepCompleted => "completed",
            Self::RunFailed | Self::StepFailed => "failed",
            Self::StepSkipped => "skipped",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed state transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub event_type: EventKind,
    pub run_id: Uuid,
    /// Present for step events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_slug: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Carried on `run:started` so mirrors can track progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_steps: Option<i32>,
}

impl FlowEvent {
    pub fn run(kind: EventKind, run_id: Uuid, timestamp: DateTime<Utc>) -> Self {
        debug_assert!(kind.is_run_event());
        Self {
            event_type: kind,
            run_id,
            step_slug: None,
            status: kind.status_str().to_string(),
            timestamp,
            output: None,
            error_message: None,
            skip_reason: None,
            remaining_steps: None,
        }
    }

    pub fn step(
        kind: EventKind,
        run_id: Uuid,
        step_slug: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        debug_assert!(!kind.is_run_event());
        Self {
            event_type: kind,
            run_id,
            step_slug: Some(step_slug.into()),
            status: kind.status_str().to_string(),
            timestamp,
            output: None,
            error_message: None,
            skip_reason: None,
            remaining_steps: None,
        }
    }

    pub fn with_output(mut self, output: Option<Value>) -> Self {
        self.output = output;
        self
    }

    pub fn with_error(mut self, error_message: impl Into<String>) -> Self {
        self.error_message = Some(error_message.into());
        self
    }

    pub fn with_skip_reason(mut self, reason: SkipReason) -> Self {
        self.skip_reason = Some(reason);
        self
    }

    pub fn with_remaining_steps(mut self, remaining: i32) -> Self {
        self.remaining_steps = Some(remaining);
        self
    }

    /// Topic key this event is broadcast under.
    pub fn topic(&self) -> String {
        format!("run:{}", self.run_id)
    }
}

/// At-least-once broadcast of state transitions, one topic per run.
pub struct NotificationBus {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<FlowEvent>>>,
    capacity: usize,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribes to a run's topic, creating it if needed.
    pub fn subscribe(&self, run_id: Uuid) -> broadcast::Receiver<FlowEvent> {
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        topics
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes an event to its run topic, returning the number of
    /// subscribers it reached. Zero subscribers is not an error; the event
    /// is simply dropped (mirrors recover via snapshot fetch).
    pub fn publish(&self, event: &FlowEvent) -> usize {
        let sender = {
            let topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            topics.get(&event.run_id).cloned()
        };
        match sender {
            Some(sender) => sender.send(event.clone()).unwrap_or(0),
            None => 0,
        }
    }

    /// Drops a run's topic; outstanding receivers observe a closed channel.
    pub fn drop_topic(&self, run_id: Uuid) {
        let mut topics = self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        topics.remove(&run_id);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

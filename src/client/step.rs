//! Client-side mirror of one step's state.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{EventKind, FlowEvent};
use crate::client::{EventFilter, ObserverSet, Subscription, WaitError};
use crate::state::{SkipReason, StepStateRecord, StepStatus};

/// Snapshot of a mirrored step, cheap to clone out of the handle.
#[derive(Clone, Debug)]
pub struct StepView {
    pub status: StepStatus,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
}

impl Default for StepView {
    fn default() -> Self {
        Self {
            status: StepStatus::Created,
            output: None,
            error_message: None,
            skip_reason: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            skipped_at: None,
        }
    }
}

/// Freshness rank; state only ever moves forward through these.
fn rank(status: StepStatus) -> u8 {
    match status {
        StepStatus::Created => 0,
        StepStatus::Started => 1,
        StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => 2,
    }
}

/// Live mirror of one step within a mirrored run.
///
/// Updates arrive from broadcast events and snapshot resyncs in any order;
/// the merge keeps whichever is fresher, and a terminal state is frozen.
pub struct StepHandle {
    run_id: Uuid,
    step_slug: String,
    state: RwLock<StepView>,
    status_tx: watch::Sender<StepStatus>,
    observers: ObserverSet,
}

impl StepHandle {
    pub(crate) fn new(run_id: Uuid, step_slug: String) -> Self {
        Self {
            run_id,
            step_slug,
            state: RwLock::new(StepView::default()),
            status_tx: watch::channel(StepStatus::Created).0,
            observers: ObserverSet::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn step_slug(&self) -> &str {
        &self.step_slug
    }

    pub fn view(&self) -> StepView {
        self.read().clone()
    }

    pub fn status(&self) -> StepStatus {
        self.read().status
    }

    pub fn output(&self) -> Option<Value> {
        self.read().output.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.read().error_message.clone()
    }

    /// Registers a callback for this step's transitions; see
    /// [`RunHandle::on`](crate::client::RunHandle::on).
    pub fn on<F>(&self, filter: EventFilter, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(filter, callback)
    }

    /// Unregisters a callback; returns whether it was still registered.
    pub fn off(&self, subscription: Subscription) -> bool {
        self.observers.unsubscribe(subscription)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StepView> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StepView> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Merges a broadcast event; stale or duplicate events are ignored.
    pub(crate) fn apply_event(&self, event: &FlowEvent) {
        let status = match event.event_type {
            EventKind::StepStarted => StepStatus::Started,
            EventKind::StepCompleted => StepStatus::Completed,
            EventKind::StepFailed => StepStatus::Failed,
            EventKind::StepSkipped => StepStatus::Skipped,
            _ => return,
        };
        let mut state = self.write();
        if state.status.is_terminal() || rank(status) < rank(state.status) {
            return;
        }
        state.status = status;
        match status {
            StepStatus::Started => state.started_at = Some(event.timestamp),
            StepStatus::Completed => {
                state.output = event.output.clone();
                state.completed_at = Some(event.timestamp);
            }
            StepStatus::Failed => {
                state.error_message = event.error_message.clone();
                state.failed_at = Some(event.timestamp);
            }
            StepStatus::Skipped => {
                state.skip_reason = event.skip_reason;
                state.output = None;
                state.skipped_at = Some(event.timestamp);
            }
            StepStatus::Created => {}
        }
        drop(state);
        let _ = self.status_tx.send_replace(status);
        self.observers.notify(event);
    }

    /// Merges a fetched snapshot record under the same freshness rule.
    pub(crate) fn apply_record(&self, record: &StepStateRecord) {
        let mut state = self.write();
        if state.status.is_terminal() || rank(record.status) < rank(state.status) {
            return;
        }
        state.status = record.status;
        state.output = record.output.clone();
        state.error_message = record.error_message.clone();
        state.skip_reason = record.skip_reason;
        state.started_at = record.started_at;
        state.completed_at = record.completed_at;
        state.failed_at = record.failed_at;
        state.skipped_at = record.skipped_at;
        drop(state);
        let _ = self.status_tx.send_replace(record.status);
    }

    /// Waits until the step reaches `target`.
    ///
    /// Resolves immediately if already there; errors if the step settles in
    /// a different terminal status or `wait` elapses first.
    pub async fn wait_for_status(
        &self,
        target: StepStatus,
        wait: Duration,
    ) -> Result<(), WaitError> {
        let mut rx = self.status_tx.subscribe();
        let watching = async {
            loop {
                let current = *rx.borrow_and_update();
                if current == target {
                    return Ok(());
                }
                if current.is_terminal() {
                    return Err(WaitError::TerminalMismatch {
                        target: target.as_str(),
                        actual: current.as_str(),
                    });
                }
                if rx.changed().await.is_err() {
                    return Err(WaitError::Closed);
                }
            }
        };
        tokio::time::timeout(wait, watching)
            .await
            .map_err(|_| WaitError::Timeout {
                target: target.as_str(),
                wait,
            })?
    }
}

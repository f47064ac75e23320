//! Client-side mirror of one run.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bus::{EventKind, FlowEvent};
use crate::client::step::StepHandle;
use crate::client::{EventFilter, ObserverSet, Subscription, WaitError};
use crate::state::{RunRecord, RunSnapshot, RunStatus};

/// Snapshot of a mirrored run, cheap to clone out of the handle.
#[derive(Clone, Debug)]
pub struct RunView {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub remaining_steps: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Default for RunView {
    fn default() -> Self {
        Self {
            status: RunStatus::Started,
            output: None,
            error_message: None,
            remaining_steps: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }
}

fn rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Started => 0,
        RunStatus::Completed | RunStatus::Failed => 1,
    }
}

/// Live mirror of a run: merges broadcast events and snapshot fetches,
/// whichever arrives first, and never moves backwards. Terminal state is
/// frozen; later events for it are ignored.
pub struct RunHandle {
    run_id: Uuid,
    flow_slug: String,
    state: RwLock<RunView>,
    status_tx: watch::Sender<RunStatus>,
    steps: Mutex<HashMap<String, Arc<StepHandle>>>,
    observers: ObserverSet,
}

impl RunHandle {
    pub(crate) fn new(run_id: Uuid, flow_slug: String) -> Self {
        Self {
            run_id,
            flow_slug,
            state: RwLock::new(RunView::default()),
            status_tx: watch::channel(RunStatus::Started).0,
            steps: Mutex::new(HashMap::new()),
            observers: ObserverSet::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn flow_slug(&self) -> &str {
        &self.flow_slug
    }

    pub fn view(&self) -> RunView {
        self.read().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.read().status
    }

    pub fn output(&self) -> Option<Value> {
        self.read().output.clone()
    }

    pub fn error_message(&self) -> Option<String> {
        self.read().error_message.clone()
    }

    pub fn remaining_steps(&self) -> Option<i32> {
        self.read().remaining_steps
    }

    /// The mirror for one step, created on first access so callers can wait
    /// on a step before any of its events arrive.
    pub fn step(&self, step_slug: &str) -> Arc<StepHandle> {
        let mut steps = self
            .steps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        steps
            .entry(step_slug.to_string())
            .or_insert_with(|| Arc::new(StepHandle::new(self.run_id, step_slug.to_string())))
            .clone()
    }

    /// Registers a callback for this run's own transitions.
    ///
    /// Callbacks fire synchronously in registration order as accepted
    /// events arrive; stale events and snapshot resyncs do not fire them.
    /// Step transitions are observed on the step view, not here.
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

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RunView> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RunView> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Routes a broadcast event to the run or step mirror it belongs to.
    pub(crate) fn apply_event(&self, event: &FlowEvent) {
        if event.run_id != self.run_id {
            return;
        }
        if event.event_type.is_run_event() {
            self.apply_run_event(event);
        } else if let Some(slug) = &event.step_slug {
            self.step(slug).apply_event(event);
            // Step terminal events carry run progress.
            if let Some(remaining) = event.remaining_steps {
                let mut state = self.write();
                if !state.status.is_terminal() {
                    state.remaining_steps = Some(remaining);
                }
            }
        }
    }

    fn apply_run_event(&self, event: &FlowEvent) {
        let status = match event.event_type {
            EventKind::RunStarted => RunStatus::Started,
            EventKind::RunCompleted => RunStatus::Completed,
            EventKind::RunFailed => RunStatus::Failed,
            _ => return,
        };
        let mut state = self.write();
        if state.status.is_terminal() || rank(status) < rank(state.status) {
            return;
        }
        state.status = status;
        match status {
            RunStatus::Started => {
                state.started_at = Some(event.timestamp);
                if event.remaining_steps.is_some() {
                    state.remaining_steps = event.remaining_steps;
                }
            }
            RunStatus::Completed => {
                state.output = event.output.clone();
                state.remaining_steps = Some(0);
                state.completed_at = Some(event.timestamp);
            }
            RunStatus::Failed => {
                state.error_message = event.error_message.clone();
                state.failed_at = Some(event.timestamp);
            }
        }
        drop(state);
        let _ = self.status_tx.send_replace(status);
        self.observers.notify(event);
    }

    /// Merges a stored run record under the freshness rule.
    pub(crate) fn apply_record(&self, record: &RunRecord) {
        let mut state = self.write();
        if state.status.is_terminal() || rank(record.status) < rank(state.status) {
            return;
        }
        state.status = record.status;
        state.output = record.output.clone();
        state.error_message = record.error_message.clone();
        state.remaining_steps = Some(record.remaining_steps);
        state.started_at = Some(record.started_at);
        state.completed_at = record.completed_at;
        state.failed_at = record.failed_at;
        drop(state);
        let _ = self.status_tx.send_replace(record.status);
    }

    /// Merges a full snapshot, run and steps alike. Used on first fetch and
    /// whenever the event stream reports a gap.
    pub(crate) fn apply_snapshot(&self, snapshot: &RunSnapshot) {
        self.apply_record(&snapshot.run);
        for step in &snapshot.steps {
            self.step(&step.step_slug).apply_record(step);
        }
    }

    /// Waits until the run reaches `target`; see [`StepHandle::wait_for_status`].
    pub async fn wait_for_status(
        &self,
        target: RunStatus,
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

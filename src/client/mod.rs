//! Client-side run mirrors.
//!
//! A [`FlowClient`] hands out at most one [`RunHandle`] per run: repeated
//! lookups return the same `Arc`, so every part of an application observes
//! one consistent view. Each handle is fed by a pump task subscribed to the
//! run's topic; the subscription is opened before the run starts (or before
//! the first snapshot fetch), so no committed event can be missed, and the
//! freshness merge makes replayed or out-of-order updates harmless.

mod run;
mod step;

pub use run::{RunHandle, RunView};
pub use step::{StepHandle, StepView};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventKind, FlowEvent};
use crate::engine::{Engine, EngineError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Why a `wait_for_status` call did not observe its target.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out after {wait:?} waiting for status {target:?}")]
    Timeout { target: &'static str, wait: Duration },

    #[error("settled at terminal status {actual:?} while waiting for {target:?}")]
    TerminalMismatch {
        target: &'static str,
        actual: &'static str,
    },

    #[error("status stream closed")]
    Closed,
}

/// Selects which events an observer callback receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event delivered to the view.
    Any,
    /// Only events of one kind.
    Kind(EventKind),
}

impl EventFilter {
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Self::Any => true,
            Self::Kind(expected) => expected == kind,
        }
    }
}

/// Token returned by `on`; pass it to `off` to unregister the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscription(u64);

type ObserverCallback = Arc<dyn Fn(&FlowEvent) + Send + Sync>;

/// Observer callbacks for one view, invoked synchronously in registration
/// order as accepted events arrive.
pub(crate) struct ObserverSet {
    next_id: AtomicU64,
    entries: Mutex<Vec<(Subscription, EventFilter, ObserverCallback)>>,
}

impl ObserverSet {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe<F>(&self, filter: EventFilter, callback: F) -> Subscription
    where
        F: Fn(&FlowEvent) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((subscription, filter, Arc::new(callback)));
        subscription
    }

    /// Removes a callback; returns whether it was still registered.
    pub(crate) fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(id, _, _)| *id != subscription);
        entries.len() != before
    }

    /// Invokes matching callbacks in registration order. The list is
    /// snapshotted first so a callback may re-enter `on`/`off`.
    pub(crate) fn notify(&self, event: &FlowEvent) {
        let matching: Vec<ObserverCallback> = self
            .lock()
            .iter()
            .filter(|(_, filter, _)| filter.matches(event.event_type))
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();
        for callback in matching {
            callback(event);
        }
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<(Subscription, EventFilter, ObserverCallback)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct RunEntry {
    handle: Arc<RunHandle>,
    pump: JoinHandle<()>,
}

/// Engine client maintaining live mirrors of observed runs.
pub struct FlowClient {
    engine: Engine,
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

impl FlowClient {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Starts a run and returns its live mirror.
    ///
    /// The topic subscription is opened before the engine call, so the
    /// mirror observes every event from `run:started` onward.
    pub async fn start_flow(
        &self,
        flow_slug: &str,
        input: Value,
        run_id: Option<Uuid>,
    ) -> Result<Arc<RunHandle>, ClientError> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let handle = Arc::new(RunHandle::new(run_id, flow_slug.to_string()));
        let pump = self.spawn_pump(run_id, Arc::clone(&handle));
        {
            let mut runs = self.lock_runs();
            if let Some(previous) = runs.insert(
                run_id,
                RunEntry {
                    handle: Arc::clone(&handle),
                    pump,
                },
            ) {
                // A reused run_id displaces its old mirror; stop its pump.
                previous.pump.abort();
            }
        }

        match self.engine.start_flow(flow_slug, input, Some(run_id)).await {
            Ok(record) => {
                handle.apply_record(&record);
                Ok(handle)
            }
            Err(error) => {
                self.dispose(run_id);
                Err(error.into())
            }
        }
    }

    /// The mirror for an existing run, or `None` if the run is unknown.
    ///
    /// Repeated calls return the identical `Arc` while the mirror lives.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Arc<RunHandle>>, ClientError> {
        if let Some(entry) = self.lock_runs().get(&run_id) {
            return Ok(Some(Arc::clone(&entry.handle)));
        }

        // Subscribe before the snapshot fetch; events landing between the
        // two merge cleanly on top of the snapshot.
        let receiver = self.engine.bus().subscribe(run_id);
        let Some(snapshot) = self.engine.run_snapshot(run_id).await? else {
            return Ok(None);
        };
        let handle = Arc::new(RunHandle::new(run_id, snapshot.run.flow_slug.clone()));
        handle.apply_snapshot(&snapshot);
        let pump = Self::pump_task(self.engine.clone(), run_id, Arc::clone(&handle), receiver);
        let mut runs = self.lock_runs();
        if let Some(existing) = runs.get(&run_id) {
            // Another caller built the mirror first; keep theirs.
            pump.abort();
            return Ok(Some(Arc::clone(&existing.handle)));
        }
        runs.insert(
            run_id,
            RunEntry {
                handle: Arc::clone(&handle),
                pump,
            },
        );
        Ok(Some(handle))
    }

    /// Drops a run's mirror and stops its pump. The next `get_run` builds a
    /// fresh mirror from a snapshot.
    pub fn dispose(&self, run_id: Uuid) {
        if let Some(entry) = self.lock_runs().remove(&run_id) {
            entry.pump.abort();
            debug!(run_id = %run_id, "run mirror disposed");
        }
    }

    pub fn dispose_all(&self) {
        let mut runs = self.lock_runs();
        for (_, entry) in runs.drain() {
            entry.pump.abort();
        }
    }

    pub fn mirrored_runs(&self) -> usize {
        self.lock_runs().len()
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_pump(&self, run_id: Uuid, handle: Arc<RunHandle>) -> JoinHandle<()> {
        let receiver = self.engine.bus().subscribe(run_id);
        Self::pump_task(self.engine.clone(), run_id, handle, receiver)
    }

    fn pump_task(
        engine: Engine,
        run_id: Uuid,
        handle: Arc<RunHandle>,
        mut receiver: tokio::sync::broadcast::Receiver<crate::bus::FlowEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handle.apply_event(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped events; recover from a snapshot.
                        warn!(run_id = %run_id, missed, "mirror lagged, resyncing");
                        match engine.run_snapshot(run_id).await {
                            Ok(Some(snapshot)) => handle.apply_snapshot(&snapshot),
                            Ok(None) => {}
                            Err(error) => {
                                warn!(run_id = %run_id, ?error, "mirror resync failed");
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for FlowClient {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

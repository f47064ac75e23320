//! Engine facade: validated flow registry, run lifecycle, task leasing.
//!
//! Every operation funnels through the store for atomicity and publishes
//! the resulting events on the notification bus only after the store call
//! returns. Subscribers therefore only ever observe committed transitions,
//! in commit order per run.

use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::NotificationBus;
use crate::flow::{FlowDefinition, ValidationError};
use crate::machine::{self, RunChanges};
use crate::state::{LeasedTask, RunRecord, RunSnapshot, SkipReason};
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
    bus: Arc<NotificationBus>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            bus: Arc::new(NotificationBus::default()),
        }
    }

    pub fn with_bus(store: Arc<dyn Store>, bus: Arc<NotificationBus>) -> Self {
        Self { store, bus }
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Validates and persists a flow definition.
    pub async fn create_flow(&self, flow: &FlowDefinition) -> Result<(), EngineError> {
        flow.validate()?;
        self.store.put_flow(flow).await?;
        info!(flow = %flow.slug, steps = flow.steps.len(), "flow registered");
        Ok(())
    }

    pub async fn get_flow(&self, slug: &str) -> Result<Arc<FlowDefinition>, EngineError> {
        Ok(self.store.get_flow(slug).await?)
    }

    /// Starts a run: materializes step states and root tasks, then emits
    /// `run:started` followed by the root steps' `step:started` events.
    pub async fn start_flow(
        &self,
        flow_slug: &str,
        input: Value,
        run_id: Option<Uuid>,
    ) -> Result<RunRecord, EngineError> {
        let flow = self.store.get_flow(flow_slug).await?;
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let set = machine::start_run(flow, run_id, input, chrono::Utc::now())?;
        let changes = self.store.insert_run(set).await?;
        let run = changes
            .run
            .clone()
            .ok_or_else(|| StoreError::Message("insert_run returned no run record".into()))?;
        counter!("trellis_runs_started_total").increment(1);
        info!(run_id = %run_id, flow = flow_slug, "run started");
        self.publish(&changes);
        Ok(run)
    }

    pub async fn run_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, EngineError> {
        Ok(self.store.run_snapshot(run_id).await?)
    }

    /// Leases up to `batch` runnable tasks for `flow_slug`. Each lease lasts
    /// the task's handler timeout plus `lease_margin_secs`; a lease that
    /// expires makes the task pollable again without burning an attempt.
    pub async fn poll_for_tasks(
        &self,
        flow_slug: &str,
        batch: usize,
        lease_margin_secs: i64,
    ) -> Result<Vec<LeasedTask>, EngineError> {
        let tasks = self.store.claim_tasks(flow_slug, batch, lease_margin_secs).await?;
        if !tasks.is_empty() {
            counter!("trellis_tasks_claimed_total").increment(tasks.len() as u64);
            debug!(flow = flow_slug, count = tasks.len(), "tasks claimed");
        }
        Ok(tasks)
    }

    /// Reports a task success. Duplicate reports for a terminal task are
    /// accepted and ignored.
    pub async fn complete_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: i32,
        output: Value,
    ) -> Result<(), EngineError> {
        let slug = step_slug.to_string();
        let changes = self
            .store
            .mutate_run(run_id, &move |set| {
                set.complete_task(&slug, task_index, output.clone())
            })
            .await?;
        counter!("trellis_tasks_completed_total").increment(1);
        debug!(run_id = %run_id, step = step_slug, task_index, "task completed");
        self.publish(&changes);
        Ok(())
    }

    /// Reports a task failure: retried with backoff while attempts remain,
    /// otherwise the step's exhaustion policy applies.
    pub async fn fail_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: i32,
        error_message: &str,
    ) -> Result<(), EngineError> {
        let slug = step_slug.to_string();
        let message = error_message.to_string();
        let changes = self
            .store
            .mutate_run(run_id, &move |set| {
                set.fail_task(&slug, task_index, &message)
            })
            .await?;
        counter!("trellis_tasks_failed_total").increment(1);
        debug!(run_id = %run_id, step = step_slug, task_index, error = error_message, "task failed");
        self.publish(&changes);
        Ok(())
    }

    /// Force-skips a step and its transitive dependents.
    pub async fn skip_step(
        &self,
        run_id: Uuid,
        step_slug: &str,
        reason: SkipReason,
    ) -> Result<(), EngineError> {
        let slug = step_slug.to_string();
        let changes = self
            .store
            .mutate_run(run_id, &move |set| set.skip_step(&slug, reason))
            .await?;
        self.publish(&changes);
        Ok(())
    }

    fn publish(&self, changes: &RunChanges) {
        for event in &changes.events {
            let receivers = self.bus.publish(event);
            counter!("trellis_events_published_total").increment(1);
            debug!(
                event = %event.event_type,
                run_id = %event.run_id,
                step = event.step_slug.as_deref().unwrap_or("-"),
                receivers,
                "event published"
            );
        }
    }
}

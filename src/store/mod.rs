//! Storage backends.
//!
//! Every mutation of a run goes through [`Store::mutate_run`], which loads
//! the run's working set under a lock, applies a machine operation, and
//! persists the dirty records atomically. The returned [`RunChanges`] carry
//! the events to publish; callers publish them only after the store call
//! returns, so subscribers never observe a transition that did not commit.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::flow::{FlowDefinition, ValidationError};
use crate::machine::{MachineError, RunChanges, RunSet};
use crate::state::{LeasedTask, RunSnapshot};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown flow {slug:?}")]
    UnknownFlow { slug: String },

    #[error("unknown run {run_id}")]
    UnknownRun { run_id: Uuid },

    #[error("run {run_id} already exists")]
    RunExists { run_id: Uuid },

    #[error("{0}")]
    Message(String),
}

/// A machine operation applied to a run's working set under the store lock.
pub type MutateOp<'a> = &'a (dyn Fn(&mut RunSet) -> Result<(), MachineError> + Send + Sync);

#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a flow definition, replacing any prior version.
    async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError>;

    async fn get_flow(&self, slug: &str) -> Result<Arc<FlowDefinition>, StoreError>;

    /// Persists a freshly materialized run with all of its step states and
    /// initial tasks in one transaction.
    async fn insert_run(&self, set: RunSet) -> Result<RunChanges, StoreError>;

    async fn run_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError>;

    /// Applies `op` to the run's working set atomically and persists the
    /// dirty records. Events in the returned changes have not been
    /// published.
    async fn mutate_run(&self, run_id: Uuid, op: MutateOp<'_>) -> Result<RunChanges, StoreError>;

    /// Claims up to `batch` runnable tasks for `flow_slug`, leasing each for
    /// its handler timeout plus `lease_margin_secs`. Runnable means queued
    /// and due, or started with an expired lease, while both the run and the
    /// owning step are still started.
    async fn claim_tasks(
        &self,
        flow_slug: &str,
        batch: usize,
        lease_margin_secs: i64,
    ) -> Result<Vec<LeasedTask>, StoreError>;
}

/// Handler input resolution shared by both backends: the run input plus the
/// completed step outputs feed [`crate::machine::resolve_task_input`].
pub(crate) fn task_input(
    flow: &FlowDefinition,
    run_input: &Value,
    completed_outputs: &std::collections::HashMap<String, Value>,
    step_slug: &str,
    task_index: i32,
) -> Result<Value, StoreError> {
    let step = flow
        .step(step_slug)
        .ok_or_else(|| StoreError::Message(format!("task references unknown step {step_slug:?}")))?;
    Ok(crate::machine::resolve_task_input(
        step,
        run_input,
        |dep| completed_outputs.get(dep).cloned(),
        task_index,
    ))
}

pub(crate) fn lease_expiry(now: DateTime<Utc>, timeout_secs: i64, margin_secs: i64) -> DateTime<Utc> {
    now + chrono::Duration::seconds(timeout_secs.max(0) + margin_secs.max(0))
}

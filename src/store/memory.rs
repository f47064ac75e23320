//! In-memory store for tests and embedded use.
//!
//! A single mutex over the whole dataset stands in for row locks: every
//! mutation holds it for the duration of the machine operation, which gives
//! the same atomicity the Postgres backend gets from transactions.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::flow::FlowDefinition;
use crate::machine::{RunChanges, RunSet};
use crate::state::{LeasedTask, RunRecord, RunSnapshot, StepStateRecord, StepStatus, TaskRecord, TaskStatus};
use crate::store::{lease_expiry, task_input, MutateOp, Store, StoreError};

#[derive(Default)]
struct MemoryInner {
    flows: HashMap<String, Arc<FlowDefinition>>,
    runs: HashMap<Uuid, RunRecord>,
    steps: HashMap<Uuid, BTreeMap<String, StepStateRecord>>,
    tasks: HashMap<Uuid, BTreeMap<(String, i32), TaskRecord>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_changes(inner: &mut MemoryInner, run_id: Uuid, changes: &RunChanges) {
        if let Some(run) = &changes.run {
            inner.runs.insert(run_id, run.clone());
        }
        let steps = inner.steps.entry(run_id).or_default();
        for step in &changes.steps {
            steps.insert(step.step_slug.clone(), step.clone());
        }
        let tasks = inner.tasks.entry(run_id).or_default();
        for task in &changes.tasks {
            tasks.insert((task.step_slug.clone(), task.task_index), task.clone());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
        flow.validate()?;
        self.lock()
            .flows
            .insert(flow.slug.clone(), Arc::new(flow.clone()));
        Ok(())
    }

    async fn get_flow(&self, slug: &str) -> Result<Arc<FlowDefinition>, StoreError> {
        self.lock()
            .flows
            .get(slug)
            .cloned()
            .ok_or_else(|| StoreError::UnknownFlow {
                slug: slug.to_string(),
            })
    }

    async fn insert_run(&self, set: RunSet) -> Result<RunChanges, StoreError> {
        let (run, steps, tasks, events) = set.into_new_run_parts();
        let run_id = run.run_id;
        let mut inner = self.lock();
        if inner.runs.contains_key(&run_id) {
            return Err(StoreError::RunExists { run_id });
        }
        let changes = RunChanges {
            run: Some(run),
            steps,
            tasks,
            events,
        };
        Self::apply_changes(&mut inner, run_id, &changes);
        Ok(changes)
    }

    async fn run_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        let inner = self.lock();
        let Some(run) = inner.runs.get(&run_id).cloned() else {
            return Ok(None);
        };
        let steps = inner
            .steps
            .get(&run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default();
        Ok(Some(RunSnapshot { run, steps }))
    }

    async fn mutate_run(&self, run_id: Uuid, op: MutateOp<'_>) -> Result<RunChanges, StoreError> {
        let mut inner = self.lock();
        let run = inner
            .runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::UnknownRun { run_id })?;
        let flow = inner
            .flows
            .get(&run.flow_slug)
            .cloned()
            .ok_or_else(|| StoreError::UnknownFlow {
                slug: run.flow_slug.clone(),
            })?;
        let steps = inner
            .steps
            .get(&run_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default();
        let tasks = inner
            .tasks
            .get(&run_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default();

        let mut set = RunSet::from_records(flow, run, steps, tasks, Utc::now());
        op(&mut set)?;
        let changes = set.take_changes();
        Self::apply_changes(&mut inner, run_id, &changes);
        Ok(changes)
    }

    async fn claim_tasks(
        &self,
        flow_slug: &str,
        batch: usize,
        lease_margin_secs: i64,
    ) -> Result<Vec<LeasedTask>, StoreError> {
        let now = Utc::now();
        let mut inner = self.lock();

        let mut candidates: Vec<(Uuid, String, i32)> = Vec::new();
        for (run_id, run) in &inner.runs {
            if run.flow_slug != flow_slug || run.status.is_terminal() {
                continue;
            }
            let Some(tasks) = inner.tasks.get(run_id) else {
                continue;
            };
            let steps = inner.steps.get(run_id);
            for task in tasks.values() {
                let step_started = steps
                    .and_then(|steps| steps.get(&task.step_slug))
                    .is_some_and(|step| step.status == StepStatus::Started);
                if !step_started {
                    continue;
                }
                let runnable = match task.status {
                    TaskStatus::Queued => task.scheduled_at <= now,
                    TaskStatus::Started => {
                        task.lease_expires_at.is_some_and(|expiry| expiry <= now)
                    }
                    _ => false,
                };
                if runnable {
                    candidates.push((*run_id, task.step_slug.clone(), task.task_index));
                }
            }
        }
        candidates.sort_by_key(|(run_id, slug, index)| {
            let scheduled = inner
                .tasks
                .get(run_id)
                .and_then(|tasks| tasks.get(&(slug.clone(), *index)))
                .map(|task| task.scheduled_at)
                .unwrap_or(now);
            (scheduled, *run_id, slug.clone(), *index)
        });
        candidates.truncate(batch);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (run_id, step_slug, task_index) in candidates {
            let (input, flow) = {
                let run = inner
                    .runs
                    .get(&run_id)
                    .ok_or(StoreError::UnknownRun { run_id })?;
                let flow = inner
                    .flows
                    .get(&run.flow_slug)
                    .cloned()
                    .ok_or_else(|| StoreError::UnknownFlow {
                        slug: run.flow_slug.clone(),
                    })?;
                (run.input.clone(), flow)
            };
            let completed: HashMap<String, serde_json::Value> = inner
                .steps
                .get(&run_id)
                .map(|steps| {
                    steps
                        .values()
                        .filter(|step| step.status == StepStatus::Completed)
                        .filter_map(|step| {
                            step.output
                                .clone()
                                .map(|output| (step.step_slug.clone(), output))
                        })
                        .collect()
                })
                .unwrap_or_default();
            let resolved = task_input(&flow, &input, &completed, &step_slug, task_index)?;

            let Some(task) = inner
                .tasks
                .get_mut(&run_id)
                .and_then(|tasks| tasks.get_mut(&(step_slug.clone(), task_index)))
            else {
                continue;
            };
            let lease_token = Uuid::new_v4();
            task.status = TaskStatus::Started;
            task.lease_token = Some(lease_token);
            task.lease_expires_at = Some(lease_expiry(now, task.timeout_secs, lease_margin_secs));
            claimed.push(LeasedTask {
                run_id,
                flow_slug: task.flow_slug.clone(),
                step_slug: task.step_slug.clone(),
                task_index,
                attempts_count: task.attempts_count,
                lease_token,
                lease_expires_at: task.lease_expires_at.unwrap_or(now),
                input: resolved,
                timeout_secs: task.timeout_secs,
            });
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepDefinition;
    use crate::machine::start_run;
    use serde_json::json;

    fn single_step_flow() -> FlowDefinition {
        let mut flow = FlowDefinition::new("solo").unwrap();
        flow.add_step(StepDefinition::single("work")).unwrap();
        flow
    }

    async fn started_run(store: &MemoryStore, input: serde_json::Value) -> Uuid {
        let flow = store.get_flow("solo").await.unwrap();
        let run_id = Uuid::new_v4();
        let set = start_run(flow, run_id, input, Utc::now()).unwrap();
        store.insert_run(set).await.unwrap();
        run_id
    }

    #[tokio::test]
    async fn claim_returns_resolved_input_and_leases() {
        let store = MemoryStore::new();
        store.put_flow(&single_step_flow()).await.unwrap();
        let run_id = started_run(&store, json!({"n": 1})).await;

        let claimed = store.claim_tasks("solo", 10, 2).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].run_id, run_id);
        assert_eq!(claimed[0].input, json!({"run": {"n": 1}}));

        // Leased tasks are invisible until the lease expires.
        assert!(store.claim_tasks("solo", 10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        // A zero timeout with zero margin expires the lease at claim time,
        // so the next poll re-delivers the same task.
        let mut flow = single_step_flow();
        flow.steps[0].policy.timeout_secs = Some(0);
        let store = MemoryStore::new();
        store.put_flow(&flow).await.unwrap();
        let run_id = started_run(&store, json!({})).await;

        let first = store.claim_tasks("solo", 10, 0).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_tasks("solo", 10, 0).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].run_id, run_id);
        // Attempts only grow on explicit failure, not on lease expiry.
        assert_eq!(second[0].attempts_count, 0);
        assert_ne!(first[0].lease_token, second[0].lease_token);
    }

    #[tokio::test]
    async fn mutate_run_applies_and_persists() {
        let store = MemoryStore::new();
        store.put_flow(&single_step_flow()).await.unwrap();
        let run_id = started_run(&store, json!({})).await;

        let changes = store
            .mutate_run(run_id, &|set| set.complete_task("work", 0, json!("done")))
            .await
            .unwrap();
        assert!(changes.run.is_some());
        assert!(!changes.events.is_empty());

        let snapshot = store.run_snapshot(run_id).await.unwrap().unwrap();
        assert!(snapshot.run.status.is_terminal());
        assert_eq!(snapshot.steps.len(), 1);
    }

    #[tokio::test]
    async fn unknown_run_and_flow_error() {
        let store = MemoryStore::new();
        let err = store.get_flow("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownFlow { .. }));
        let err = store
            .mutate_run(Uuid::new_v4(), &|_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownRun { .. }));
    }
}

//! The execution state machine.
//!
//! All run/step/task transitions are implemented here as synchronous
//! operations over a `RunSet`: the working set of one run's records loaded
//! under a store lock. The store applies an operation, persists the dirty
//! records in the same transaction, and publishes the returned events after
//! commit. Keeping the machine pure keeps every backend's semantics
//! identical and makes transitions exactly-once-effective: a duplicate
//! terminal report finds a terminal record and becomes a no-op.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EventKind, FlowEvent};
use crate::flow::{FlowDefinition, RuntimePolicy, SkipPolicy, StepDefinition, StepType, ValidationError};
use crate::state::{
    RunRecord, RunStatus, SkipReason, StepStateRecord, StepStatus, TaskRecord, TaskStatus,
};
use crate::value::condition_met;

#[derive(Debug, Error, PartialEq)]
pub enum MachineError {
    #[error("run {run_id} has no step {step:?}")]
    UnknownStep { run_id: Uuid, step: String },

    #[error("run {run_id} has no task {step:?}[{index}]")]
    UnknownTask {
        run_id: Uuid,
        step: String,
        index: i32,
    },
}

/// Retry delay in seconds: `base * 2^(attempts-1)`, capped by the step's
/// timeout so a long retry tail cannot outgrow the policy window.
pub fn retry_delay_secs(policy: &RuntimePolicy, attempts_count: i32) -> i64 {
    if policy.base_delay_secs <= 0 || attempts_count <= 0 {
        return 0;
    }
    let exponent = (attempts_count - 1).clamp(0, 31) as u32;
    let delay = policy.base_delay_secs.saturating_mul(1i64 << exponent);
    delay.min(policy.timeout_secs.max(policy.base_delay_secs))
}

/// Resolves the handler input for one task.
///
/// Single steps receive `{"run": <run input>, "<dep>": <dep output>, ...}`
/// restricted to direct dependencies; map steps receive the source array
/// element at `task_index`.
pub fn resolve_task_input<F>(
    step: &StepDefinition,
    run_input: &Value,
    dep_output: F,
    task_index: i32,
) -> Value
where
    F: Fn(&str) -> Option<Value>,
{
    match step.step_type {
        StepType::Map => {
            let source = match step.deps.first() {
                Some(dep) => dep_output(dep).unwrap_or(Value::Null),
                None => run_input.clone(),
            };
            match source {
                Value::Array(items) => items
                    .get(task_index as usize)
                    .cloned()
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            }
        }
        StepType::Single => {
            let mut object = Map::new();
            object.insert("run".to_string(), run_input.clone());
            for dep in &step.deps {
                object.insert(dep.clone(), dep_output(dep).unwrap_or(Value::Null));
            }
            Value::Object(object)
        }
    }
}

/// Dirty records and pending events produced by one machine operation.
#[derive(Debug, Default)]
pub struct RunChanges {
    pub run: Option<RunRecord>,
    pub steps: Vec<StepStateRecord>,
    pub tasks: Vec<TaskRecord>,
    pub events: Vec<FlowEvent>,
}

/// One run's records, loaded for mutation under the store's lock.
#[derive(Debug)]
pub struct RunSet {
    flow: Arc<FlowDefinition>,
    now: DateTime<Utc>,
    run: RunRecord,
    run_dirty: bool,
    steps: BTreeMap<String, StepStateRecord>,
    dirty_steps: BTreeSet<String>,
    tasks: BTreeMap<(String, i32), TaskRecord>,
    dirty_tasks: BTreeSet<(String, i32)>,
    events: Vec<FlowEvent>,
}

/// Materializes a new run: validates input shape, creates the run record
/// and one step state per step, then activates every ready root step.
pub fn start_run(
    flow: Arc<FlowDefinition>,
    run_id: Uuid,
    input: Value,
    now: DateTime<Utc>,
) -> Result<RunSet, ValidationError> {
    for step in &flow.steps {
        if step.step_type == StepType::Map && step.is_root() && !input.is_array() {
            return Err(ValidationError::NonArrayInput {
                step: step.slug.clone(),
            });
        }
    }

    let run = RunRecord {
        run_id,
        flow_slug: flow.slug.clone(),
        status: RunStatus::Started,
        input,
        output: None,
        remaining_steps: flow.steps.len() as i32,
        error_message: None,
        started_at: now,
        completed_at: None,
        failed_at: None,
    };

    let mut steps = BTreeMap::new();
    for def in &flow.steps {
        let initial_tasks = match def.step_type {
            StepType::Single => Some(1),
            StepType::Map if def.is_root() => {
                Some(run.input.as_array().map(Vec::len).unwrap_or(0) as i32)
            }
            // Known once the producing dependency completes.
            StepType::Map => None,
        };
        steps.insert(
            def.slug.clone(),
            StepStateRecord {
                run_id,
                flow_slug: flow.slug.clone(),
                step_slug: def.slug.clone(),
                status: StepStatus::Created,
                remaining_deps: def.deps.len() as i32,
                remaining_tasks: initial_tasks.unwrap_or(0),
                initial_tasks,
                output: None,
                error_message: None,
                skip_reason: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                failed_at: None,
                skipped_at: None,
            },
        );
    }

    let remaining = run.remaining_steps;
    let mut set = RunSet {
        flow,
        now,
        run,
        run_dirty: true,
        steps,
        dirty_steps: BTreeSet::new(),
        tasks: BTreeMap::new(),
        dirty_tasks: BTreeSet::new(),
        events: Vec::new(),
    };
    set.dirty_steps
        .extend(set.steps.keys().cloned().collect::<Vec<_>>());
    set.events.push(
        FlowEvent::run(EventKind::RunStarted, run_id, now).with_remaining_steps(remaining),
    );

    let ready: Vec<String> = set
        .steps
        .values()
        .filter(|step| step.remaining_deps == 0)
        .map(|step| step.step_slug.clone())
        .collect();
    for slug in ready {
        set.activate_step(&slug);
    }
    Ok(set)
}

impl RunSet {
    /// Rehydrates a working set from stored records.
    pub fn from_records(
        flow: Arc<FlowDefinition>,
        run: RunRecord,
        steps: Vec<StepStateRecord>,
        tasks: Vec<TaskRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            flow,
            now,
            run,
            run_dirty: false,
            steps: steps
                .into_iter()
                .map(|step| (step.step_slug.clone(), step))
                .collect(),
            dirty_steps: BTreeSet::new(),
            tasks: tasks
                .into_iter()
                .map(|task| ((task.step_slug.clone(), task.task_index), task))
                .collect(),
            dirty_tasks: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    pub fn flow(&self) -> &Arc<FlowDefinition> {
        &self.flow
    }

    pub fn run(&self) -> &RunRecord {
        &self.run
    }

    pub fn step(&self, slug: &str) -> Option<&StepStateRecord> {
        self.steps.get(slug)
    }

    pub fn task(&self, slug: &str, index: i32) -> Option<&TaskRecord> {
        self.tasks.get(&(slug.to_string(), index))
    }

    /// Consumes a freshly materialized run into its complete record set.
    pub fn into_new_run_parts(
        self,
    ) -> (
        RunRecord,
        Vec<StepStateRecord>,
        Vec<TaskRecord>,
        Vec<FlowEvent>,
    ) {
        (
            self.run,
            self.steps.into_values().collect(),
            self.tasks.into_values().collect(),
            self.events,
        )
    }

    /// Drains the dirty records and pending events after an operation.
    pub fn take_changes(&mut self) -> RunChanges {
        let run = self.run_dirty.then(|| self.run.clone());
        self.run_dirty = false;
        let steps = std::mem::take(&mut self.dirty_steps)
            .into_iter()
            .filter_map(|slug| self.steps.get(&slug).cloned())
            .collect();
        let tasks = std::mem::take(&mut self.dirty_tasks)
            .into_iter()
            .filter_map(|key| self.tasks.get(&key).cloned())
            .collect();
        RunChanges {
            run,
            steps,
            tasks,
            events: std::mem::take(&mut self.events),
        }
    }

    /// Records a task success and advances the owning step when it was the
    /// last outstanding task. Terminal tasks and terminal runs make this a
    /// no-op.
    pub fn complete_task(
        &mut self,
        step_slug: &str,
        task_index: i32,
        output: Value,
    ) -> Result<(), MachineError> {
        let key = (step_slug.to_string(), task_index);
        let task = self
            .tasks
            .get_mut(&key)
            .ok_or_else(|| MachineError::UnknownTask {
                run_id: self.run.run_id,
                step: step_slug.to_string(),
                index: task_index,
            })?;
        if task.status.is_terminal() {
            warn!(
                run_id = %self.run.run_id,
                step = step_slug,
                task_index,
                "ignoring completion for terminal task"
            );
            return Ok(());
        }
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.completed_at = Some(self.now);
        task.lease_token = None;
        task.lease_expires_at = None;
        self.dirty_tasks.insert(key);

        if self.run.status.is_terminal() {
            return Ok(());
        }
        let step = self.step_mut(step_slug)?;
        if step.status != StepStatus::Started {
            return Ok(());
        }
        step.remaining_tasks -= 1;
        let done = step.remaining_tasks == 0;
        self.dirty_steps.insert(step_slug.to_string());
        if done {
            let output = self.aggregate_output(step_slug)?;
            self.complete_step(step_slug, output)?;
        }
        Ok(())
    }

    /// Records a task failure: re-queues with backoff while attempts
    /// remain, otherwise applies the step's `when_exhausted` policy.
    pub fn fail_task(
        &mut self,
        step_slug: &str,
        task_index: i32,
        error_message: &str,
    ) -> Result<(), MachineError> {
        let policy = match self.flow.step(step_slug) {
            Some(def) => self.flow.effective_policy(def),
            None => {
                return Err(MachineError::UnknownStep {
                    run_id: self.run.run_id,
                    step: step_slug.to_string(),
                });
            }
        };
        let run_terminal = self.run.status.is_terminal();
        let key = (step_slug.to_string(), task_index);
        let task = self
            .tasks
            .get_mut(&key)
            .ok_or_else(|| MachineError::UnknownTask {
                run_id: self.run.run_id,
                step: step_slug.to_string(),
                index: task_index,
            })?;
        if task.status.is_terminal() {
            warn!(
                run_id = %self.run.run_id,
                step = step_slug,
                task_index,
                "ignoring failure for terminal task"
            );
            return Ok(());
        }

        task.attempts_count += 1;
        task.error_message = Some(error_message.to_string());
        task.lease_token = None;
        task.lease_expires_at = None;

        if !run_terminal && task.attempts_count < policy.max_attempts {
            let delay = retry_delay_secs(&policy, task.attempts_count);
            task.status = TaskStatus::Queued;
            task.scheduled_at = self.now + Duration::seconds(delay);
            debug!(
                run_id = %self.run.run_id,
                step = step_slug,
                task_index,
                attempt = task.attempts_count,
                delay_secs = delay,
                "task requeued for retry"
            );
            self.dirty_tasks.insert(key);
            return Ok(());
        }

        task.status = TaskStatus::Failed;
        task.failed_at = Some(self.now);
        self.dirty_tasks.insert(key);
        if run_terminal {
            return Ok(());
        }
        let step = self.step_mut(step_slug)?;
        if step.status.is_terminal() {
            return Ok(());
        }
        let policy_decision = self
            .flow
            .step(step_slug)
            .map(|def| def.when_exhausted)
            .unwrap_or_default();
        let message = error_message.to_string();
        match policy_decision {
            SkipPolicy::Fail => self.fail_step(step_slug, &message)?,
            SkipPolicy::Skip | SkipPolicy::SkipCascade => {
                self.skip_cascade(step_slug, SkipReason::HandlerFailed)?;
            }
        }
        Ok(())
    }

    /// Force-skips a non-terminal step and cascades to its dependents.
    pub fn skip_step(&mut self, step_slug: &str, reason: SkipReason) -> Result<(), MachineError> {
        let step = self.step_mut(step_slug)?;
        if step.status.is_terminal() {
            warn!(
                run_id = %self.run.run_id,
                step = step_slug,
                "ignoring skip for terminal step"
            );
            return Ok(());
        }
        if self.run.status.is_terminal() {
            return Ok(());
        }
        self.skip_cascade(step_slug, reason)
    }

    fn step_mut(&mut self, slug: &str) -> Result<&mut StepStateRecord, MachineError> {
        let run_id = self.run.run_id;
        self.steps
            .get_mut(slug)
            .ok_or_else(|| MachineError::UnknownStep {
                run_id,
                step: slug.to_string(),
            })
    }

    /// Starts a ready step if its condition holds; otherwise applies
    /// `when_unmet`. Called whenever `remaining_deps` reaches zero.
    fn activate_step(&mut self, slug: &str) {
        // A sibling may have failed the run earlier in the same operation;
        // no step starts inside a terminal run.
        if self.run.status.is_terminal() {
            return;
        }
        let Some(def) = self.flow.step(slug).cloned() else {
            return;
        };
        {
            let Some(step) = self.steps.get(slug) else {
                return;
            };
            if step.status != StepStatus::Created || step.remaining_deps != 0 {
                return;
            }
        }

        let condition_input = if def.is_root() {
            self.run.input.clone()
        } else {
            let mut object = Map::new();
            for dep in &def.deps {
                let output = self
                    .steps
                    .get(dep)
                    .and_then(|state| state.output.clone())
                    .unwrap_or(Value::Null);
                object.insert(dep.clone(), output);
            }
            Value::Object(object)
        };

        if !condition_met(
            &condition_input,
            def.condition.as_ref(),
            def.condition_not.as_ref(),
        ) {
            debug!(run_id = %self.run.run_id, step = slug, "step condition unmet");
            match def.when_unmet {
                SkipPolicy::Fail => {
                    let _ = self.fail_step(slug, "condition not met");
                }
                SkipPolicy::Skip | SkipPolicy::SkipCascade => {
                    let _ = self.skip_cascade(slug, SkipReason::ConditionUnmet);
                }
            }
            return;
        }

        let task_count = match def.step_type {
            StepType::Single => 1,
            StepType::Map => {
                let source = match def.deps.first() {
                    Some(dep) => self
                        .steps
                        .get(dep)
                        .and_then(|state| state.output.clone())
                        .unwrap_or(Value::Null),
                    None => self.run.input.clone(),
                };
                source.as_array().map(Vec::len).unwrap_or(0) as i32
            }
        };

        let policy = self.flow.effective_policy(&def);
        {
            let Some(step) = self.steps.get_mut(slug) else {
                return;
            };
            step.status = StepStatus::Started;
            step.started_at = Some(self.now);
            step.initial_tasks = Some(task_count);
            step.remaining_tasks = task_count;
        }
        self.dirty_steps.insert(slug.to_string());
        self.events.push(FlowEvent::step(
            EventKind::StepStarted,
            self.run.run_id,
            slug,
            self.now,
        ));

        if task_count == 0 {
            // Map over an empty array: nothing to execute.
            let _ = self.complete_step(slug, Value::Array(Vec::new()));
            return;
        }

        let scheduled_at = self.now + Duration::seconds(policy.start_delay_secs.max(0));
        for index in 0..task_count {
            let key = (slug.to_string(), index);
            self.tasks.insert(
                key.clone(),
                TaskRecord {
                    run_id: self.run.run_id,
                    flow_slug: self.run.flow_slug.clone(),
                    step_slug: slug.to_string(),
                    task_index: index,
                    status: TaskStatus::Queued,
                    attempts_count: 0,
                    output: None,
                    error_message: None,
                    lease_token: None,
                    lease_expires_at: None,
                    timeout_secs: policy.timeout_secs,
                    scheduled_at,
                    queued_at: self.now,
                    completed_at: None,
                    failed_at: None,
                },
            );
            self.dirty_tasks.insert(key);
        }
    }

    fn aggregate_output(&self, slug: &str) -> Result<Value, MachineError> {
        let def = self
            .flow
            .step(slug)
            .ok_or_else(|| MachineError::UnknownStep {
                run_id: self.run.run_id,
                step: slug.to_string(),
            })?;
        match def.step_type {
            StepType::Map => {
                let mut outputs: Vec<(i32, Value)> = self
                    .tasks
                    .iter()
                    .filter(|((task_slug, _), _)| task_slug == slug)
                    .map(|((_, index), task)| {
                        (*index, task.output.clone().unwrap_or(Value::Null))
                    })
                    .collect();
                outputs.sort_by_key(|(index, _)| *index);
                Ok(Value::Array(
                    outputs.into_iter().map(|(_, output)| output).collect(),
                ))
            }
            StepType::Single => Ok(self
                .task(slug, 0)
                .and_then(|task| task.output.clone())
                .unwrap_or(Value::Null)),
        }
    }

    /// Terminal success for a step: records the aggregate output, wakes
    /// dependents, and finalizes the run when it was the last step.
    fn complete_step(&mut self, slug: &str, output: Value) -> Result<(), MachineError> {
        // A dependent map step needs an array to fan out over; anything
        // else is a type violation charged to the producing step.
        let dependents: Vec<String> = self
            .flow
            .dependents_of(slug)
            .into_iter()
            .map(str::to_string)
            .collect();
        let feeds_map = dependents.iter().any(|dependent| {
            self.flow
                .step(dependent)
                .is_some_and(|def| def.step_type == StepType::Map)
        });
        if feeds_map && !output.is_array() {
            return self.fail_step(
                slug,
                &format!("TYPE_VIOLATION: step '{slug}' must produce an array for its dependent map step"),
            );
        }

        {
            let now = self.now;
            let step = self.step_mut(slug)?;
            step.status = StepStatus::Completed;
            step.output = Some(output.clone());
            step.completed_at = Some(now);
        }
        self.dirty_steps.insert(slug.to_string());
        self.run.remaining_steps -= 1;
        self.run_dirty = true;
        self.events.push(
            FlowEvent::step(EventKind::StepCompleted, self.run.run_id, slug, self.now)
                .with_output(Some(output))
                .with_remaining_steps(self.run.remaining_steps),
        );

        for dependent in dependents {
            let newly_ready = {
                let Some(step) = self.steps.get_mut(&dependent) else {
                    continue;
                };
                if step.status != StepStatus::Created {
                    continue;
                }
                step.remaining_deps -= 1;
                self.dirty_steps.insert(dependent.clone());
                step.remaining_deps == 0
            };
            if newly_ready {
                self.activate_step(&dependent);
            }
        }

        self.finalize_if_done();
        Ok(())
    }

    /// Terminal failure for a step; `when_failed` decides whether the run
    /// fails or downstream steps are skipped instead.
    fn fail_step(&mut self, slug: &str, error_message: &str) -> Result<(), MachineError> {
        {
            let now = self.now;
            let step = self.step_mut(slug)?;
            step.status = StepStatus::Failed;
            step.error_message = Some(error_message.to_string());
            step.failed_at = Some(now);
        }
        self.dirty_steps.insert(slug.to_string());
        self.run.remaining_steps -= 1;
        self.run_dirty = true;
        self.events.push(
            FlowEvent::step(EventKind::StepFailed, self.run.run_id, slug, self.now)
                .with_error(error_message)
                .with_remaining_steps(self.run.remaining_steps),
        );

        let when_failed = self
            .flow
            .step(slug)
            .map(|def| def.when_failed)
            .unwrap_or_default();
        match when_failed {
            SkipPolicy::Fail => {
                self.fail_run(&format!("step '{slug}' failed: {error_message}"));
            }
            SkipPolicy::Skip | SkipPolicy::SkipCascade => {
                let dependents: Vec<String> = self
                    .flow
                    .dependents_of(slug)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                for dependent in dependents {
                    self.skip_cascade(&dependent, SkipReason::DependencySkipped)?;
                }
                self.finalize_if_done();
            }
        }
        Ok(())
    }

    /// Skips a step and, breadth-first, every non-terminal transitive
    /// dependent. Dependents always skip with `DependencySkipped`; the
    /// originating reason applies only to the first step.
    fn skip_cascade(&mut self, origin: &str, reason: SkipReason) -> Result<(), MachineError> {
        let mut queue = std::collections::VecDeque::new();
        queue.push_back((origin.to_string(), reason));
        while let Some((slug, reason)) = queue.pop_front() {
            {
                let Some(step) = self.steps.get_mut(&slug) else {
                    continue;
                };
                if step.status.is_terminal() {
                    continue;
                }
                step.status = StepStatus::Skipped;
                step.skip_reason = Some(reason);
                step.output = None;
                step.skipped_at = Some(self.now);
            }
            self.dirty_steps.insert(slug.clone());
            self.run.remaining_steps -= 1;
            self.run_dirty = true;
            self.events.push(
                FlowEvent::step(EventKind::StepSkipped, self.run.run_id, &slug, self.now)
                    .with_skip_reason(reason)
                    .with_remaining_steps(self.run.remaining_steps),
            );
            for dependent in self.flow.dependents_of(&slug) {
                queue.push_back((dependent.to_string(), SkipReason::DependencySkipped));
            }
        }
        self.finalize_if_done();
        Ok(())
    }

    fn fail_run(&mut self, error_message: &str) {
        if self.run.status.is_terminal() {
            return;
        }
        self.run.status = RunStatus::Failed;
        self.run.error_message = Some(error_message.to_string());
        self.run.failed_at = Some(self.now);
        self.run_dirty = true;
        self.events.push(
            FlowEvent::run(EventKind::RunFailed, self.run.run_id, self.now)
                .with_error(error_message),
        );
    }

    /// Completes the run once every step is terminal and none failed it.
    /// The run output is the leaf steps' outputs keyed by slug; skipped
    /// leaves contribute null so the shape stays stable.
    fn finalize_if_done(&mut self) {
        if self.run.status != RunStatus::Started || self.run.remaining_steps > 0 {
            return;
        }
        let mut output = Map::new();
        for leaf in self.flow.leaf_slugs() {
            let value = self
                .steps
                .get(leaf)
                .and_then(|step| step.output.clone())
                .unwrap_or(Value::Null);
            output.insert(leaf.to_string(), value);
        }
        self.run.status = RunStatus::Completed;
        self.run.output = Some(Value::Object(output));
        self.run.completed_at = Some(self.now);
        self.run_dirty = true;
        self.events.push(
            FlowEvent::run(EventKind::RunCompleted, self.run.run_id, self.now)
                .with_output(self.run.output.clone()),
        );
    }
}

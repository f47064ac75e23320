//! Postgres-backed store.
//!
//! Run mutations load the working set under `SELECT ... FOR UPDATE` on the
//! run row, apply the machine operation, and write back only the dirty
//! records before committing. Task claiming uses a `FOR UPDATE SKIP LOCKED`
//! CTE so concurrent workers never contend on the same rows.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::flow::FlowDefinition;
use crate::machine::{RunChanges, RunSet};
use crate::state::{
    LeasedTask, RunRecord, RunSnapshot, RunStatus, SkipReason, StepStateRecord, StepStatus,
    TaskRecord, TaskStatus,
};
use crate::store::{task_input, MutateOp, Store, StoreError};

const DEFAULT_MAX_CONNECTIONS: u32 = 16;

pub struct PostgresStore {
    pool: PgPool,
    // Definitions are immutable once published in practice; cache them so
    // claims and mutations skip a flows read per call.
    flow_cache: Mutex<HashMap<String, Arc<FlowDefinition>>>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            flow_cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn cached_flow(&self, slug: &str) -> Option<Arc<FlowDefinition>> {
        self.flow_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(slug)
            .cloned()
    }

    fn cache_flow(&self, flow: Arc<FlowDefinition>) {
        self.flow_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(flow.slug.clone(), flow);
    }

    fn decode_status<T>(raw: &str, parse: fn(&str) -> Option<T>, kind: &str) -> Result<T, StoreError> {
        parse(raw).ok_or_else(|| StoreError::Message(format!("invalid {kind} status {raw:?}")))
    }

    fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
        let status: String = row.try_get("status")?;
        Ok(RunRecord {
            run_id: row.try_get("run_id")?,
            flow_slug: row.try_get("flow_slug")?,
            status: Self::decode_status(&status, RunStatus::parse, "run")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            remaining_steps: row.try_get("remaining_steps")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
        })
    }

    fn step_from_row(row: &PgRow) -> Result<StepStateRecord, StoreError> {
        let status: String = row.try_get("status")?;
        let skip_reason: Option<String> = row.try_get("skip_reason")?;
        let skip_reason = match skip_reason {
            Some(raw) => Some(Self::decode_status(&raw, SkipReason::parse, "skip reason")?),
            None => None,
        };
        Ok(StepStateRecord {
            run_id: row.try_get("run_id")?,
            flow_slug: row.try_get("flow_slug")?,
            step_slug: row.try_get("step_slug")?,
            status: Self::decode_status(&status, StepStatus::parse, "step")?,
            remaining_deps: row.try_get("remaining_deps")?,
            remaining_tasks: row.try_get("remaining_tasks")?,
            initial_tasks: row.try_get("initial_tasks")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            skip_reason,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
            skipped_at: row.try_get("skipped_at")?,
        })
    }

    fn task_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
        let status: String = row.try_get("status")?;
        Ok(TaskRecord {
            run_id: row.try_get("run_id")?,
            flow_slug: row.try_get("flow_slug")?,
            step_slug: row.try_get("step_slug")?,
            task_index: row.try_get("task_index")?,
            status: Self::decode_status(&status, TaskStatus::parse, "task")?,
            attempts_count: row.try_get("attempts_count")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            lease_token: row.try_get("lease_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            timeout_secs: row.try_get("timeout_secs")?,
            scheduled_at: row.try_get("scheduled_at")?,
            queued_at: row.try_get("queued_at")?,
            completed_at: row.try_get("completed_at")?,
            failed_at: row.try_get("failed_at")?,
        })
    }

    async fn write_run<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        run: &RunRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE runs
            SET status = $2,
                output = $3,
                remaining_steps = $4,
                error_message = $5,
                completed_at = $6,
                failed_at = $7
            WHERE run_id = $1
            "#,
        )
        .bind(run.run_id)
        .bind(run.status.as_str())
        .bind(&run.output)
        .bind(run.remaining_steps)
        .bind(&run.error_message)
        .bind(run.completed_at)
        .bind(run.failed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_steps<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        steps: &[StepStateRecord],
    ) -> Result<(), StoreError> {
        for step in steps {
            sqlx::query(
                r#"
                UPDATE step_states
                SET status = $3,
                    remaining_deps = $4,
                    remaining_tasks = $5,
                    initial_tasks = $6,
                    output = $7,
                    error_message = $8,
                    skip_reason = $9,
                    started_at = $10,
                    completed_at = $11,
                    failed_at = $12,
                    skipped_at = $13
                WHERE run_id = $1 AND step_slug = $2
                "#,
            )
            .bind(step.run_id)
            .bind(&step.step_slug)
            .bind(step.status.as_str())
            .bind(step.remaining_deps)
            .bind(step.remaining_tasks)
            .bind(step.initial_tasks)
            .bind(&step.output)
            .bind(&step.error_message)
            .bind(step.skip_reason.map(SkipReason::as_str))
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(step.failed_at)
            .bind(step.skipped_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_tasks<'t>(
        tx: &mut sqlx::Transaction<'t, Postgres>,
        tasks: &[TaskRecord],
    ) -> Result<(), StoreError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO step_tasks (run_id, flow_slug, step_slug, task_index, status, \
             attempts_count, output, error_message, lease_token, lease_expires_at, \
             timeout_secs, scheduled_at, queued_at, completed_at, failed_at) ",
        );
        builder.push_values(tasks.iter(), |mut builder, task| {
            builder
                .push_bind(task.run_id)
                .push_bind(&task.flow_slug)
                .push_bind(&task.step_slug)
                .push_bind(task.task_index)
                .push_bind(task.status.as_str())
                .push_bind(task.attempts_count)
                .push_bind(&task.output)
                .push_bind(&task.error_message)
                .push_bind(task.lease_token)
                .push_bind(task.lease_expires_at)
                .push_bind(task.timeout_secs)
                .push_bind(task.scheduled_at)
                .push_bind(task.queued_at)
                .push_bind(task.completed_at)
                .push_bind(task.failed_at);
        });
        builder.push(
            " ON CONFLICT (run_id, step_slug, task_index) DO UPDATE SET \
             status = EXCLUDED.status, attempts_count = EXCLUDED.attempts_count, \
             output = EXCLUDED.output, error_message = EXCLUDED.error_message, \
             lease_token = EXCLUDED.lease_token, lease_expires_at = EXCLUDED.lease_expires_at, \
             scheduled_at = EXCLUDED.scheduled_at, completed_at = EXCLUDED.completed_at, \
             failed_at = EXCLUDED.failed_at",
        );
        builder.build().execute(&mut **tx).await?;
        Ok(())
    }

    async fn load_flow(&self, slug: &str) -> Result<Arc<FlowDefinition>, StoreError> {
        if let Some(flow) = self.cached_flow(slug) {
            return Ok(flow);
        }
        let row = sqlx::query("SELECT definition FROM flows WHERE flow_slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::UnknownFlow {
                slug: slug.to_string(),
            });
        };
        let definition: Value = row.try_get("definition")?;
        let flow: FlowDefinition = serde_json::from_value(definition)?;
        let flow = Arc::new(flow);
        self.cache_flow(flow.clone());
        Ok(flow)
    }

    /// Per-run context needed to resolve claimed task inputs.
    async fn run_inputs(
        &self,
        run_id: Uuid,
    ) -> Result<(Value, HashMap<String, Value>), StoreError> {
        let row = sqlx::query("SELECT input FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::UnknownRun { run_id })?;
        let input: Value = row.try_get("input")?;
        let rows = sqlx::query(
            "SELECT step_slug, output FROM step_states WHERE run_id = $1 AND status = 'completed'",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut outputs = HashMap::with_capacity(rows.len());
        for row in rows {
            let slug: String = row.try_get("step_slug")?;
            let output: Option<Value> = row.try_get("output")?;
            outputs.insert(slug, output.unwrap_or(Value::Null));
        }
        Ok((input, outputs))
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn put_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
        flow.validate()?;
        let definition = serde_json::to_value(flow)?;
        sqlx::query(
            r#"
            INSERT INTO flows (flow_slug, definition)
            VALUES ($1, $2)
            ON CONFLICT (flow_slug)
            DO UPDATE SET definition = EXCLUDED.definition, updated_at = now()
            "#,
        )
        .bind(&flow.slug)
        .bind(definition)
        .execute(&self.pool)
        .await?;
        self.cache_flow(Arc::new(flow.clone()));
        Ok(())
    }

    async fn get_flow(&self, slug: &str) -> Result<Arc<FlowDefinition>, StoreError> {
        self.load_flow(slug).await
    }

    async fn insert_run(&self, set: RunSet) -> Result<RunChanges, StoreError> {
        let (run, steps, tasks, events) = set.into_new_run_parts();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO runs
                (run_id, flow_slug, status, input, output, remaining_steps,
                 error_message, started_at, completed_at, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.flow_slug)
        .bind(run.status.as_str())
        .bind(&run.input)
        .bind(&run.output)
        .bind(run.remaining_steps)
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.failed_at)
        .execute(&mut *tx)
        .await
        .map_err(|error| match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::RunExists { run_id: run.run_id }
            }
            _ => StoreError::Database(error),
        })?;

        if !steps.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO step_states (run_id, flow_slug, step_slug, status, \
                 remaining_deps, remaining_tasks, initial_tasks, output, error_message, \
                 skip_reason, created_at, started_at, completed_at, failed_at, skipped_at) ",
            );
            builder.push_values(steps.iter(), |mut builder, step| {
                builder
                    .push_bind(step.run_id)
                    .push_bind(&step.flow_slug)
                    .push_bind(&step.step_slug)
                    .push_bind(step.status.as_str())
                    .push_bind(step.remaining_deps)
                    .push_bind(step.remaining_tasks)
                    .push_bind(step.initial_tasks)
                    .push_bind(&step.output)
                    .push_bind(&step.error_message)
                    .push_bind(step.skip_reason.map(SkipReason::as_str))
                    .push_bind(step.created_at)
                    .push_bind(step.started_at)
                    .push_bind(step.completed_at)
                    .push_bind(step.failed_at)
                    .push_bind(step.skipped_at);
            });
            builder.build().execute(&mut *tx).await?;
        }
        Self::write_tasks(&mut tx, &tasks).await?;
        tx.commit().await?;

        Ok(RunChanges {
            run: Some(run),
            steps,
            tasks,
            events,
        })
    }

    async fn run_snapshot(&self, run_id: Uuid) -> Result<Option<RunSnapshot>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let run = Self::run_from_row(&row)?;
        let rows = sqlx::query("SELECT * FROM step_states WHERE run_id = $1 ORDER BY step_slug")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        let steps = rows
            .iter()
            .map(Self::step_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(RunSnapshot { run, steps }))
    }

    async fn mutate_run(&self, run_id: Uuid, op: MutateOp<'_>) -> Result<RunChanges, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = $1 FOR UPDATE")
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::UnknownRun { run_id })?;
        let run = Self::run_from_row(&row)?;
        let flow = self.load_flow(&run.flow_slug).await?;

        let step_rows = sqlx::query("SELECT * FROM step_states WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?;
        let steps = step_rows
            .iter()
            .map(Self::step_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let task_rows = sqlx::query("SELECT * FROM step_tasks WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&mut *tx)
            .await?;
        let tasks = task_rows
            .iter()
            .map(Self::task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let mut set = RunSet::from_records(flow, run, steps, tasks, Utc::now());
        op(&mut set)?;
        let changes = set.take_changes();

        if let Some(run) = &changes.run {
            Self::write_run(&mut tx, run).await?;
        }
        Self::write_steps(&mut tx, &changes.steps).await?;
        Self::write_tasks(&mut tx, &changes.tasks).await?;
        tx.commit().await?;
        Ok(changes)
    }

    async fn claim_tasks(
        &self,
        flow_slug: &str,
        batch: usize,
        lease_margin_secs: i64,
    ) -> Result<Vec<LeasedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH candidate AS (
                SELECT t.run_id, t.step_slug, t.task_index
                FROM step_tasks t
                JOIN runs r ON r.run_id = t.run_id
                JOIN step_states s
                    ON s.run_id = t.run_id AND s.step_slug = t.step_slug
                WHERE t.flow_slug = $1
                  AND r.status = 'started'
                  AND s.status = 'started'
                  AND (
                        (t.status = 'queued' AND t.scheduled_at <= now())
                     OR (t.status = 'started' AND t.lease_expires_at <= now())
                  )
                ORDER BY t.scheduled_at
                LIMIT $2
                FOR UPDATE OF t SKIP LOCKED
            )
            UPDATE step_tasks t
            SET status = 'started',
                lease_token = gen_random_uuid(),
                lease_expires_at = now()
                    + make_interval(secs => (t.timeout_secs + $3)::double precision)
            FROM candidate c
            WHERE t.run_id = c.run_id
              AND t.step_slug = c.step_slug
              AND t.task_index = c.task_index
            RETURNING t.run_id, t.flow_slug, t.step_slug, t.task_index,
                      t.attempts_count, t.lease_token, t.lease_expires_at,
                      t.timeout_secs
            "#,
        )
        .bind(flow_slug)
        .bind(batch as i64)
        .bind(lease_margin_secs.max(0))
        .fetch_all(&self.pool)
        .await?;

        let mut by_run: HashMap<Uuid, (Value, HashMap<String, Value>)> = HashMap::new();
        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let run_id: Uuid = row.try_get("run_id")?;
            let step_slug: String = row.try_get("step_slug")?;
            let task_index: i32 = row.try_get("task_index")?;
            if !by_run.contains_key(&run_id) {
                let context = self.run_inputs(run_id).await?;
                by_run.insert(run_id, context);
            }
            let (run_input, outputs) = &by_run[&run_id];
            let flow = self.load_flow(&row.try_get::<String, _>("flow_slug")?).await?;
            let input = task_input(&flow, run_input, outputs, &step_slug, task_index)?;
            claimed.push(LeasedTask {
                run_id,
                flow_slug: row.try_get("flow_slug")?,
                step_slug,
                task_index,
                attempts_count: row.try_get("attempts_count")?,
                lease_token: row
                    .try_get::<Option<Uuid>, _>("lease_token")?
                    .ok_or_else(|| StoreError::Message("claimed task missing lease".into()))?,
                lease_expires_at: row
                    .try_get::<Option<chrono::DateTime<Utc>>, _>("lease_expires_at")?
                    .ok_or_else(|| StoreError::Message("claimed task missing lease expiry".into()))?,
                input,
                timeout_secs: row.try_get("timeout_secs")?,
            });
        }
        Ok(claimed)
    }
}

//! Polling worker: claims leased tasks and executes registered handlers.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    engine::Engine,
    handler::{HandlerRegistry, TaskContext},
    state::LeasedTask,
};

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Flow this worker executes; one worker polls one flow.
    pub flow_slug: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
    /// Grace period added to each task's handler timeout when leasing, so
    /// a healthy handler finishes before its lease lapses.
    pub lease_margin_secs: i64,
}

impl WorkerConfig {
    pub fn new(flow_slug: impl Into<String>) -> Self {
        Self {
            flow_slug: flow_slug.into(),
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            max_concurrent: num_cpus::get().max(1) * 2,
            lease_margin_secs: 2,
        }
    }
}

pub struct FlowWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl FlowWorker {
    pub fn start(config: WorkerConfig, engine: Engine, registry: HandlerRegistry) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = WorkerTask {
                config,
                engine,
                registry: Arc::new(registry),
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "flow worker terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stops polling, waits for in-flight handlers, then returns.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("flow worker task panicked: {err}")),
        }
    }
}

struct WorkerTask {
    config: WorkerConfig,
    engine: Engine,
    registry: Arc<HandlerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkerTask {
    async fn run(mut self) -> Result<()> {
        info!(
            flow = %self.config.flow_slug,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "starting flow worker",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_and_dispatch(&semaphore).await {
                        metrics::counter!("trellis_worker_errors_total").increment(1);
                        error!(?err, "polling cycle failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!(flow = %self.config.flow_slug, "flow worker shutting down");
                        break;
                    }
                }
            }
        }

        self.wait_for_inflight(&semaphore).await;
        Ok(())
    }

    async fn poll_and_dispatch(&self, semaphore: &Arc<Semaphore>) -> Result<()> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(());
        }
        let limit = available.min(self.config.batch_size.max(1));

        let tasks = self
            .engine
            .poll_for_tasks(&self.config.flow_slug, limit, self.config.lease_margin_secs)
            .await?;
        if tasks.is_empty() {
            return Ok(());
        }
        debug!(flow = %self.config.flow_slug, count = tasks.len(), "dispatching tasks");

        for task in tasks {
            let permit = semaphore.clone().acquire_owned().await?;
            let engine = self.engine.clone();
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                if let Err(err) = Self::execute_task(engine, registry, task, permit).await {
                    metrics::counter!("trellis_worker_errors_total").increment(1);
                    error!(?err, "task execution failed to report");
                }
            });
        }
        Ok(())
    }

    async fn execute_task(
        engine: Engine,
        registry: Arc<HandlerRegistry>,
        task: LeasedTask,
        _permit: OwnedSemaphorePermit,
    ) -> Result<()> {
        let Some(handler) = registry.get(&task.step_slug) else {
            warn!(
                run_id = %task.run_id,
                step = %task.step_slug,
                "no handler registered for step"
            );
            engine
                .fail_task(
                    task.run_id,
                    &task.step_slug,
                    task.task_index,
                    &format!("no handler registered for step '{}'", task.step_slug),
                )
                .await?;
            return Ok(());
        };

        let ctx = TaskContext {
            run_id: task.run_id,
            flow_slug: task.flow_slug.clone(),
            step_slug: task.step_slug.clone(),
            task_index: task.task_index,
            attempts_count: task.attempts_count,
        };
        let budget = Duration::from_secs(task.timeout_secs.max(1) as u64);
        let outcome = timeout(budget, handler.run(task.input.clone(), ctx)).await;

        match outcome {
            Ok(Ok(output)) => {
                engine
                    .complete_task(task.run_id, &task.step_slug, task.task_index, output)
                    .await?;
            }
            Ok(Err(err)) => {
                engine
                    .fail_task(
                        task.run_id,
                        &task.step_slug,
                        task.task_index,
                        &format!("{err:#}"),
                    )
                    .await?;
            }
            Err(_) => {
                metrics::counter!("trellis_handler_timeouts_total").increment(1);
                engine
                    .fail_task(
                        task.run_id,
                        &task.step_slug,
                        task.task_index,
                        &format!("handler timed out after {}s", task.timeout_secs),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn wait_for_inflight(&mut self, semaphore: &Arc<Semaphore>) {
        let expected = self.config.max_concurrent.max(1);
        loop {
            if semaphore.available_permits() == expected {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

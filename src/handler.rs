//! Step handlers and their registry.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Execution context passed alongside the resolved input.
#[derive(Clone, Debug)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub task_index: i32,
    /// Prior failed attempts for this task; zero on first delivery.
    pub attempts_count: i32,
}

/// User code executed for each task of a step.
///
/// The returned value becomes the task output; an error consumes one
/// attempt. Handlers should be idempotent: an expired lease re-delivers the
/// same task without consuming an attempt.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> StepHandler for FnHandler<F>
where
    F: Fn(Value, TaskContext) -> anyhow::Result<Value> + Send + Sync,
{
    async fn run(&self, input: Value, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(input, ctx)
    }
}

/// Maps step slugs to their handlers for one flow.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, step_slug: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step_slug.into(), handler);
        self
    }

    /// Registers a synchronous closure as a handler.
    pub fn register_fn<F>(self, step_slug: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value, TaskContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(step_slug, Arc::new(FnHandler(handler)))
    }

    pub fn get(&self, step_slug: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step_slug).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_handlers_run() {
        let registry = HandlerRegistry::new()
            .register_fn("double", |input, _ctx| Ok(json!(input.as_i64().unwrap_or(0) * 2)));
        let handler = registry.get("double").unwrap();
        let ctx = TaskContext {
            run_id: Uuid::new_v4(),
            flow_slug: "flow".into(),
            step_slug: "double".into(),
            task_index: 0,
            attempts_count: 0,
        };
        assert_eq!(handler.run(json!(21), ctx).await.unwrap(), json!(42));
        assert!(registry.get("missing").is_none());
    }
}

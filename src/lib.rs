//! Trellis - durable workflow (DAG) execution over Postgres.
//!
//! Flows are named DAGs of steps; each step fans out into one task (single)
//! or one task per input element (map). Runs advance through a pure state
//! machine applied atomically by a storage backend, workers lease tasks with
//! visibility timeouts, and clients follow live runs through broadcast
//! mirrors.

pub mod bus;
pub mod client;
pub mod config;
pub mod engine;
pub mod flow;
pub mod handler;
pub mod machine;
pub mod observability;
pub mod state;
pub mod store;
pub mod value;
pub mod worker;

pub use bus::{EventKind, FlowEvent, NotificationBus};
pub use client::{
    ClientError, EventFilter, FlowClient, RunHandle, RunView, StepHandle, StepView, Subscription,
    WaitError,
};
pub use config::Config;
pub use engine::{Engine, EngineError};
pub use flow::{
    FlowDefinition, PolicyOverrides, RuntimePolicy, SkipPolicy, StepDefinition, StepType,
    ValidationError,
};
pub use handler::{HandlerRegistry, StepHandler, TaskContext};
pub use state::{
    LeasedTask, RunRecord, RunSnapshot, RunStatus, SkipReason, StepStateRecord, StepStatus,
    TaskRecord, TaskStatus,
};
pub use store::{memory::MemoryStore, postgres::PostgresStore, Store, StoreError};
pub use worker::{FlowWorker, WorkerConfig};

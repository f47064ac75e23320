//! Persisted runtime records: runs, step states, and step tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Started,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step was skipped rather than executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The step's own condition did not match its input.
    ConditionUnmet,
    /// An upstream dependency was skipped, so this step has no input.
    DependencySkipped,
    /// The step's handler failed past its retry budget under a skip policy.
    HandlerFailed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConditionUnmet => "condition_unmet",
            Self::DependencySkipped => "dependency_skipped",
            Self::HandlerFailed => "handler_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "condition_unmet" => Some(Self::ConditionUnmet),
            "dependency_skipped" => Some(Self::DependencySkipped),
            "handler_failed" => Some(Self::HandlerFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub status: RunStatus,
    pub input: Value,
    /// Leaf-step outputs keyed by slug, set on completion.
    pub output: Option<Value>,
    /// Steps not yet terminal; zero triggers run finalization.
    pub remaining_steps: i32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// A step's status within one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepStateRecord {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub status: StepStatus,
    /// Unsatisfied direct dependencies; zero makes the step ready.
    pub remaining_deps: i32,
    /// Tasks not yet terminal; zero triggers terminal evaluation.
    pub remaining_tasks: i32,
    /// Task fan-out; None until a dependent map step's source array is known.
    pub initial_tasks: Option<i32>,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub skip_reason: Option<SkipReason>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub skipped_at: Option<DateTime<Utc>>,
}

/// One unit of work backing a step state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub task_index: i32,
    pub status: TaskStatus,
    /// Incremented only on explicit failure, never on lease expiry.
    pub attempts_count: i32,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Effective handler timeout, denormalized from the step policy so the
    /// claim query can size leases without loading the flow definition.
    pub timeout_secs: i64,
    /// Earliest poll time; carries start delays and retry backoff.
    pub scheduled_at: DateTime<Utc>,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a run and all of its step states.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: RunRecord,
    pub steps: Vec<StepStateRecord>,
}

/// A claimed task handed to a worker, with its resolved handler input.
#[derive(Clone, Debug)]
pub struct LeasedTask {
    pub run_id: Uuid,
    pub flow_slug: String,
    pub step_slug: String,
    pub task_index: i32,
    pub attempts_count: i32,
    pub lease_token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
    /// For single steps `{"run": input, "<dep>": output, ...}`; for map
    /// steps the source array element at `task_index`.
    pub input: Value,
    /// Effective handler timeout for this step.
    pub timeout_secs: i64,
}

//! Invocation domain model.
//!
//! An invocation is one execution of a workflow. The controller never owns
//! this aggregate; it reads snapshots from the invocation cache and reacts
//! to status changes.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::workflow::Workflow;

/// Lifecycle status of an invocation.
///
/// Status progresses monotonically toward a terminal state; once terminal,
/// the aggregate is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationLifecycle {
    /// Submitted but no task has been dispatched yet.
    Scheduled,
    /// At least one task has been dispatched.
    InProgress,
    /// All tasks finished and the output is available.
    Succeeded,
    /// A rule or the workflow itself failed the invocation.
    Failed,
    /// Canceled from the outside.
    Aborted,
}

impl Default for InvocationLifecycle {
    fn default() -> Self {
        Self::Scheduled
    }
}

impl InvocationLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Check if this is an active (non-terminal) state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// State of a single task run within an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    /// Dispatched to the task executor, not yet running.
    Scheduled,
    /// Currently executing.
    Running,
    /// Finished with an output.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Canceled together with the invocation.
    Aborted,
}

impl TaskRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    /// Permanent failure, as opposed to success or cancellation.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// One task run inside an invocation's per-task status map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub task_id: String,
    pub state: TaskRunState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    pub fn scheduled(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskRunState::Scheduled,
            output: None,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable submission-time description of an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSpec {
    /// The workflow this invocation executes.
    pub workflow_id: Uuid,
    /// Invocation-level inputs, referenced by task input expressions.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Optional per-invocation deadline overriding the global timeout.
    pub deadline: Option<DateTime<Utc>>,
    /// Parent invocation for nested workflows.
    pub parent: Option<Uuid>,
    /// Embedded workflow snapshot; when absent the controller resolves the
    /// workflow through the workflow cache.
    pub workflow: Option<Workflow>,
}

impl InvocationSpec {
    pub fn new(workflow_id: Uuid) -> Self {
        Self {
            workflow_id,
            inputs: HashMap::new(),
            deadline: None,
            parent: None,
            workflow: None,
        }
    }
}

/// Mutable status of an invocation, maintained by the event store behind
/// the invocation cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationStatus {
    pub lifecycle: InvocationLifecycle,
    /// Per-task status map keyed by task id.
    #[serde(default)]
    pub tasks: HashMap<String, TaskRun>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// A read-only snapshot of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub spec: InvocationSpec,
    pub status: InvocationStatus,
    pub created_at: DateTime<Utc>,
}

impl Invocation {
    pub fn new(spec: InvocationSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: InvocationStatus::default(),
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.lifecycle.is_terminal()
    }

    /// The instant after which the deadline rule fails this invocation.
    ///
    /// The spec deadline wins over the global default when present.
    pub fn expires_at(&self, default_timeout: Duration) -> DateTime<Utc> {
        self.spec
            .deadline
            .unwrap_or(self.created_at + default_timeout)
    }

    /// Status of a single task run, if it has been dispatched.
    pub fn task_run(&self, task_id: &str) -> Option<&TaskRun> {
        self.status.tasks.get(task_id)
    }
}

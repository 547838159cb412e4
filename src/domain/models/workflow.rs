//! Workflow domain model.
//!
//! A workflow is a DAG of task specs with `requires` dependencies. Like the
//! invocation aggregate it is externally owned; the controller only reads it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Readiness of a workflow definition.
///
/// A workflow becomes `Ready` once its definition has been parsed and its
/// task functions resolved. A not-ready workflow blocks evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Definition submitted, functions still resolving.
    Pending,
    /// Fully resolved and schedulable.
    Ready,
    /// Definition failed to parse or resolve.
    Failed,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Specification of one task node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Function the task executor invokes.
    pub function: String,
    /// Task ids that must reach a terminal state before this one runs.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Task inputs; string values may be inline expressions resolved
    /// against the invocation-scoped expression store.
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    /// Optional per-task timeout in seconds.
    pub timeout_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            requires: Vec::new(),
            inputs: HashMap::new(),
            timeout_secs: None,
        }
    }

    pub fn requires(mut self, task_id: impl Into<String>) -> Self {
        self.requires.push(task_id.into());
        self
    }
}

/// A workflow definition: a task DAG plus a designated output task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub status: WorkflowStatus,
    /// Task DAG keyed by task id.
    pub tasks: HashMap<String, TaskSpec>,
    /// The task whose output becomes the invocation output.
    pub output_task: String,
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(tasks: HashMap<String, TaskSpec>, output_task: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: WorkflowStatus::Ready,
            tasks,
            output_task: output_task.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }
}

/// The scheduler's verdict on what to run next for one invocation.
///
/// Produced by the external workflow scheduler; the schedule rule translates
/// it into invoke actions.
#[derive(Debug, Clone, Default)]
pub struct SchedulingPlan {
    /// Ids of tasks whose dependencies are satisfied and that have not been
    /// dispatched yet, in dispatch order.
    pub run_tasks: Vec<String>,
}

impl SchedulingPlan {
    pub fn is_empty(&self) -> bool {
        self.run_tasks.is_empty()
    }
}

/// Fully resolved description of one task dispatch, handed to the task API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInvocationSpec {
    pub invocation_id: Uuid,
    pub task_id: String,
    pub function: String,
    pub inputs: HashMap<String, Value>,
    pub deadline: Option<DateTime<Utc>>,
}

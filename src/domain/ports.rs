//! Port traits for the controller's external collaborators.
//!
//! The controller owns none of the aggregates it reacts to. Everything it
//! reads or mutates goes through these seams, so tests and the bundled
//! in-memory adapters can stand in for the real engine services.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::errors::DomainResult;
use super::models::{
    CacheNotification, Invocation, SchedulingPlan, TaskInvocationSpec, Workflow,
};

/// Read access to the event-sourced invocation aggregates, plus the update
/// stream the notification listener consumes.
#[async_trait]
pub trait InvocationCache: Send + Sync {
    /// Fetch the current snapshot of one invocation.
    async fn get(&self, id: Uuid) -> DomainResult<Invocation>;

    /// List all invocations currently known to the cache.
    async fn list(&self) -> DomainResult<Vec<Invocation>>;

    /// Subscribe to aggregate updates. Receivers that lag are expected to
    /// resubscribe and rely on the recovery sweeper for repair.
    fn subscribe(&self) -> broadcast::Receiver<CacheNotification>;
}

/// Read access to workflow definitions.
#[async_trait]
pub trait WorkflowCache: Send + Sync {
    async fn get(&self, id: Uuid) -> DomainResult<Workflow>;
}

/// Invocation-scoped scratch space for expression evaluation.
///
/// Resolution must be pure or cache-backed; it runs inside the rule chain,
/// which is non-blocking by contract.
#[async_trait]
pub trait ExpressionStore: Send + Sync {
    /// Resolve inline expressions in `inputs` against the invocation scope.
    async fn resolve(
        &self,
        invocation: &Invocation,
        task_id: &str,
        inputs: &HashMap<String, Value>,
    ) -> DomainResult<HashMap<String, Value>>;

    /// Drop the scratch partition for a finished invocation.
    async fn delete(&self, invocation_id: Uuid);
}

/// The workflow-level scheduler, consulted as a black box.
#[async_trait]
pub trait WorkflowScheduler: Send + Sync {
    /// Produce a scheduling plan for the invocation's current task statuses.
    async fn schedule(
        &self,
        invocation: &Invocation,
        workflow: &Workflow,
    ) -> DomainResult<SchedulingPlan>;
}

/// A unit of work dispatched under an invocation's group id.
pub type GroupJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The task-dispatch runtime.
///
/// The executor is the source of truth for in-flight work: the quiescence
/// check before every evaluation asks it how many jobs of the invocation's
/// group are still running.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Submit a job under a group id. Jobs of one group run in submission
    /// order.
    async fn submit(&self, group: Uuid, job: GroupJob) -> DomainResult<()>;

    /// Number of jobs of this group that are queued or running.
    async fn in_flight(&self, group: Uuid) -> usize;
}

/// Write surface of the invocation API.
#[async_trait]
pub trait InvocationApi: Send + Sync {
    /// Move the invocation to `Failed`. A no-op on already-terminal state.
    async fn fail(&self, id: Uuid, cause: &str) -> DomainResult<()>;

    /// Move the invocation to `Succeeded` with the given output. A no-op on
    /// already-terminal state.
    async fn complete(&self, id: Uuid, output: Value) -> DomainResult<()>;
}

/// Write surface of the task API.
#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Dispatch one task run; returns the task-invocation id.
    async fn invoke(&self, spec: TaskInvocationSpec) -> DomainResult<Uuid>;
}

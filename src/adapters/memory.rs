//! In-memory implementations of the controller's ports.
//!
//! These back the bundled daemon binary and the integration suite. The
//! invocation store doubles as cache and api: applying an effect mutates
//! the aggregate and publishes the matching notification, closing the
//! controller's feedback loop without an external engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    CacheNotification, Invocation, InvocationLifecycle, NotificationKind, SchedulingPlan,
    TaskInvocationSpec, TaskRun, TaskRunState, Workflow,
};
use crate::domain::ports::{
    ExpressionStore, GroupJob, InvocationApi, InvocationCache, TaskApi, TaskExecutor,
    WorkflowCache, WorkflowScheduler,
};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Invocation store: cache + api
// ---------------------------------------------------------------------------

/// Map-backed invocation aggregate store.
pub struct InMemoryInvocationStore {
    invocations: RwLock<HashMap<Uuid, Invocation>>,
    events: broadcast::Sender<CacheNotification>,
}

impl Default for InMemoryInvocationStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            invocations: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl InMemoryInvocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new invocation and publish `InvocationCreated`.
    pub async fn submit(&self, invocation: Invocation) -> Uuid {
        let id = invocation.id;
        self.invocations.write().await.insert(id, invocation);
        self.publish(NotificationKind::InvocationCreated, id);
        id
    }

    /// Insert without publishing. Simulates an aggregate whose creation
    /// event was lost; only the recovery sweeper can find it.
    pub async fn submit_silently(&self, invocation: Invocation) -> Uuid {
        let id = invocation.id;
        self.invocations.write().await.insert(id, invocation);
        id
    }

    /// Current snapshot of one invocation, if it exists.
    pub async fn get_snapshot(&self, id: Uuid) -> Option<Invocation> {
        self.invocations.read().await.get(&id).cloned()
    }

    /// Record a task run result and publish the matching task event.
    pub async fn finish_task(
        &self,
        invocation_id: Uuid,
        task_id: &str,
        output: Result<Value, String>,
    ) -> DomainResult<()> {
        {
            let mut invocations = self.invocations.write().await;
            let invocation = invocations
                .get_mut(&invocation_id)
                .ok_or(DomainError::InvocationNotFound(invocation_id))?;
            let run = invocation
                .status
                .tasks
                .entry(task_id.to_string())
                .or_insert_with(|| TaskRun::scheduled(task_id));
            match &output {
                Ok(value) => {
                    run.state = TaskRunState::Succeeded;
                    run.output = Some(value.clone());
                }
                Err(error) => {
                    run.state = TaskRunState::Failed;
                    run.error = Some(error.clone());
                }
            }
            run.updated_at = Utc::now();
        }
        let kind = if output.is_ok() {
            NotificationKind::TaskSucceeded
        } else {
            NotificationKind::TaskFailed
        };
        self.publish(kind, invocation_id);
        Ok(())
    }

    /// Mark a task as dispatched, moving the invocation in progress.
    pub async fn mark_task_scheduled(
        &self,
        invocation_id: Uuid,
        task_id: &str,
    ) -> DomainResult<()> {
        let mut invocations = self.invocations.write().await;
        let invocation = invocations
            .get_mut(&invocation_id)
            .ok_or(DomainError::InvocationNotFound(invocation_id))?;
        invocation
            .status
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskRun::scheduled(task_id));
        if invocation.status.lifecycle == InvocationLifecycle::Scheduled {
            invocation.status.lifecycle = InvocationLifecycle::InProgress;
        }
        Ok(())
    }

    fn publish(&self, kind: NotificationKind, invocation_id: Uuid) {
        // Send fails only when nobody subscribed yet; the sweeper covers
        // that window.
        let _ = self.events.send(CacheNotification::new(kind, invocation_id));
    }
}

#[async_trait]
impl InvocationCache for InMemoryInvocationStore {
    async fn get(&self, id: Uuid) -> DomainResult<Invocation> {
        self.invocations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DomainError::InvocationNotFound(id))
    }

    async fn list(&self) -> DomainResult<Vec<Invocation>> {
        Ok(self.invocations.read().await.values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<CacheNotification> {
        self.events.subscribe()
    }
}

#[async_trait]
impl InvocationApi for InMemoryInvocationStore {
    async fn fail(&self, id: Uuid, cause: &str) -> DomainResult<()> {
        {
            let mut invocations = self.invocations.write().await;
            let invocation = invocations
                .get_mut(&id)
                .ok_or(DomainError::InvocationNotFound(id))?;
            // Idempotent on terminal state.
            if invocation.is_terminal() {
                return Ok(());
            }
            invocation.status.lifecycle = InvocationLifecycle::Failed;
            invocation.status.error = Some(cause.to_string());
            for run in invocation.status.tasks.values_mut() {
                if !run.state.is_terminal() {
                    run.state = TaskRunState::Aborted;
                    run.updated_at = Utc::now();
                }
            }
        }
        self.publish(NotificationKind::InvocationFailed, id);
        Ok(())
    }

    async fn complete(&self, id: Uuid, output: Value) -> DomainResult<()> {
        {
            let mut invocations = self.invocations.write().await;
            let invocation = invocations
                .get_mut(&id)
                .ok_or(DomainError::InvocationNotFound(id))?;
            if invocation.is_terminal() {
                return Ok(());
            }
            invocation.status.lifecycle = InvocationLifecycle::Succeeded;
            invocation.status.output = Some(output);
        }
        self.publish(NotificationKind::InvocationCompleted, id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Workflow cache
// ---------------------------------------------------------------------------

/// Map-backed workflow definitions.
#[derive(Default)]
pub struct InMemoryWorkflowCache {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
}

impl InMemoryWorkflowCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, workflow: Workflow) -> Uuid {
        let id = workflow.id;
        self.workflows.write().await.insert(id, workflow);
        id
    }
}

#[async_trait]
impl WorkflowCache for InMemoryWorkflowCache {
    async fn get(&self, id: Uuid) -> DomainResult<Workflow> {
        self.workflows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DomainError::WorkflowNotFound(id))
    }
}

// ---------------------------------------------------------------------------
// Expression store
// ---------------------------------------------------------------------------

/// Invocation-scoped scratch with a minimal reference syntax.
///
/// String inputs of the form `$input.<key>` resolve to the invocation's
/// inputs; `$task.<id>.output` resolves to a finished task's output.
/// Everything else passes through untouched.
#[derive(Default)]
pub struct InMemoryExpressionStore {
    scratch: RwLock<HashMap<Uuid, HashMap<String, Value>>>,
}

impl InMemoryExpressionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn partitions(&self) -> usize {
        self.scratch.read().await.len()
    }

    fn resolve_reference(invocation: &Invocation, expr: &str) -> DomainResult<Value> {
        if let Some(key) = expr.strip_prefix("$input.") {
            return invocation
                .spec
                .inputs
                .get(key)
                .cloned()
                .ok_or_else(|| DomainError::ExpressionFailed(format!("unknown input {key}")));
        }
        if let Some(rest) = expr.strip_prefix("$task.") {
            let (task_id, field) = rest
                .split_once('.')
                .ok_or_else(|| DomainError::ExpressionFailed(format!("malformed reference {expr}")))?;
            if field != "output" {
                return Err(DomainError::ExpressionFailed(format!(
                    "unsupported field {field} in {expr}"
                )));
            }
            return invocation
                .task_run(task_id)
                .and_then(|run| run.output.clone())
                .ok_or_else(|| {
                    DomainError::ExpressionFailed(format!("no output for task {task_id}"))
                });
        }
        Ok(Value::String(expr.to_string()))
    }
}

#[async_trait]
impl ExpressionStore for InMemoryExpressionStore {
    async fn resolve(
        &self,
        invocation: &Invocation,
        task_id: &str,
        inputs: &HashMap<String, Value>,
    ) -> DomainResult<HashMap<String, Value>> {
        let mut resolved = HashMap::with_capacity(inputs.len());
        for (key, value) in inputs {
            let value = match value {
                Value::String(expr) if expr.starts_with('$') => {
                    Self::resolve_reference(invocation, expr)?
                }
                other => other.clone(),
            };
            resolved.insert(key.clone(), value);
        }
        self.scratch
            .write()
            .await
            .entry(invocation.id)
            .or_default()
            .insert(task_id.to_string(), Value::Object(Default::default()));
        Ok(resolved)
    }

    async fn delete(&self, invocation_id: Uuid) {
        self.scratch.write().await.remove(&invocation_id);
    }
}

// ---------------------------------------------------------------------------
// Workflow scheduler
// ---------------------------------------------------------------------------

/// Dependency-order scheduler.
///
/// Plans every task whose `requires` are all succeeded and that has not
/// been dispatched yet. Deterministic order: lexicographic by task id.
pub struct DependencyScheduler;

#[async_trait]
impl WorkflowScheduler for DependencyScheduler {
    async fn schedule(
        &self,
        invocation: &Invocation,
        workflow: &Workflow,
    ) -> DomainResult<SchedulingPlan> {
        let mut run_tasks: Vec<String> = workflow
            .tasks
            .iter()
            .filter(|(task_id, _)| invocation.task_run(task_id).is_none())
            .filter(|(_, spec)| {
                spec.requires.iter().all(|dep| {
                    invocation
                        .task_run(dep)
                        .is_some_and(|run| run.state == TaskRunState::Succeeded)
                })
            })
            .map(|(task_id, _)| task_id.clone())
            .collect();
        run_tasks.sort();
        Ok(SchedulingPlan { run_tasks })
    }
}

// ---------------------------------------------------------------------------
// Task executor
// ---------------------------------------------------------------------------

struct GroupWorker {
    jobs: mpsc::UnboundedSender<GroupJob>,
}

/// Executor with per-group FIFO workers and in-flight accounting.
#[derive(Default)]
pub struct InMemoryTaskExecutor {
    groups: Mutex<HashMap<Uuid, GroupWorker>>,
    counts: Arc<RwLock<HashMap<Uuid, usize>>>,
}

impl InMemoryTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutor for InMemoryTaskExecutor {
    async fn submit(&self, group: Uuid, job: GroupJob) -> DomainResult<()> {
        *self.counts.write().await.entry(group).or_insert(0) += 1;

        let mut groups = self.groups.lock().await;
        let worker = groups.entry(group).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<GroupJob>();
            let counts = self.counts.clone();
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                    let mut counts = counts.write().await;
                    if let Some(count) = counts.get_mut(&group) {
                        *count = count.saturating_sub(1);
                    }
                }
            });
            GroupWorker { jobs: tx }
        });
        worker
            .jobs
            .send(job)
            .map_err(|_| DomainError::ApiFailed("task executor worker stopped".to_string()))
    }

    async fn in_flight(&self, group: Uuid) -> usize {
        self.counts.read().await.get(&group).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Loopback task api
// ---------------------------------------------------------------------------

/// Task api that echoes its inputs back as the task output after a short
/// simulated run. Lets the daemon binary demonstrate the full loop without
/// a function runtime.
pub struct LoopbackTaskApi {
    store: Arc<InMemoryInvocationStore>,
    run_delay: Duration,
}

impl LoopbackTaskApi {
    pub fn new(store: Arc<InMemoryInvocationStore>, run_delay: Duration) -> Self {
        Self { store, run_delay }
    }
}

#[async_trait]
impl TaskApi for LoopbackTaskApi {
    async fn invoke(&self, spec: TaskInvocationSpec) -> DomainResult<Uuid> {
        self.store
            .mark_task_scheduled(spec.invocation_id, &spec.task_id)
            .await?;
        debug!(
            invocation_id = %spec.invocation_id,
            task_id = %spec.task_id,
            function = %spec.function,
            "loopback dispatch"
        );

        let store = self.store.clone();
        let delay = self.run_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let output = serde_json::to_value(&spec.inputs).unwrap_or(Value::Null);
            if let Err(err) = store
                .finish_task(spec.invocation_id, &spec.task_id, Ok(output))
                .await
            {
                warn!(error = %err, "loopback task completion failed");
            }
        });
        Ok(Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{InvocationSpec, TaskSpec};
    use serde_json::json;

    fn one_task_workflow() -> Workflow {
        let mut tasks = HashMap::new();
        tasks.insert("t1".to_string(), TaskSpec::new("fn-t1"));
        Workflow::new(tasks, "t1")
    }

    #[tokio::test]
    async fn fail_is_idempotent_on_terminal_invocations() {
        let store = InMemoryInvocationStore::new();
        let workflow = one_task_workflow();
        let id = store
            .submit(Invocation::new(InvocationSpec::new(workflow.id)))
            .await;

        store.fail(id, "timed out").await.unwrap();
        store.fail(id, "second strike").await.unwrap();

        let invocation = store.get(id).await.unwrap();
        assert_eq!(invocation.status.lifecycle, InvocationLifecycle::Failed);
        // First transition wins; the cause is not overwritten.
        assert_eq!(invocation.status.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn complete_after_fail_is_a_no_op() {
        let store = InMemoryInvocationStore::new();
        let id = store
            .submit(Invocation::new(InvocationSpec::new(Uuid::new_v4())))
            .await;

        store.fail(id, "dead").await.unwrap();
        store.complete(id, json!(1)).await.unwrap();

        let invocation = store.get(id).await.unwrap();
        assert_eq!(invocation.status.lifecycle, InvocationLifecycle::Failed);
        assert!(invocation.status.output.is_none());
    }

    #[tokio::test]
    async fn dependency_scheduler_respects_requires() {
        let mut tasks = HashMap::new();
        tasks.insert("a".to_string(), TaskSpec::new("fn-a"));
        tasks.insert("b".to_string(), TaskSpec::new("fn-b").requires("a"));
        let workflow = Workflow::new(tasks, "b");
        let mut invocation = Invocation::new(InvocationSpec::new(workflow.id));

        let scheduler = DependencyScheduler;
        let plan = scheduler.schedule(&invocation, &workflow).await.unwrap();
        assert_eq!(plan.run_tasks, vec!["a".to_string()]);

        invocation.status.tasks.insert(
            "a".to_string(),
            TaskRun {
                task_id: "a".to_string(),
                state: TaskRunState::Succeeded,
                output: Some(json!(1)),
                error: None,
                updated_at: Utc::now(),
            },
        );
        let plan = scheduler.schedule(&invocation, &workflow).await.unwrap();
        assert_eq!(plan.run_tasks, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn expression_store_resolves_references() {
        let store = InMemoryExpressionStore::new();
        let mut spec = InvocationSpec::new(Uuid::new_v4());
        spec.inputs.insert("name".to_string(), json!("windlass"));
        let mut invocation = Invocation::new(spec);
        invocation.status.tasks.insert(
            "t1".to_string(),
            TaskRun {
                task_id: "t1".to_string(),
                state: TaskRunState::Succeeded,
                output: Some(json!(42)),
                error: None,
                updated_at: Utc::now(),
            },
        );

        let mut inputs = HashMap::new();
        inputs.insert("greeting".to_string(), json!("$input.name"));
        inputs.insert("previous".to_string(), json!("$task.t1.output"));
        inputs.insert("constant".to_string(), json!(7));

        let resolved = store.resolve(&invocation, "t2", &inputs).await.unwrap();
        assert_eq!(resolved["greeting"], json!("windlass"));
        assert_eq!(resolved["previous"], json!(42));
        assert_eq!(resolved["constant"], json!(7));

        assert_eq!(store.partitions().await, 1);
        store.delete(invocation.id).await;
        assert_eq!(store.partitions().await, 0);
    }

    #[tokio::test]
    async fn executor_preserves_group_order_and_counts() {
        let executor = InMemoryTaskExecutor::new();
        let group = Uuid::new_v4();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = order.clone();
            let job: GroupJob = Box::pin(async move {
                order.lock().await.push(i);
            });
            executor.submit(group, job).await.unwrap();
        }

        // Wait for the group worker to drain.
        for _ in 0..50 {
            if executor.in_flight(group).await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.in_flight(group).await, 0);
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }
}

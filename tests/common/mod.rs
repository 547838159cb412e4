//! Shared harness for controller integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use windlass::adapters::{
    DependencyScheduler, InMemoryExpressionStore, InMemoryInvocationStore, InMemoryTaskExecutor,
    InMemoryWorkflowCache,
};
use windlass::domain::models::{
    ControllerConfig, Invocation, InvocationSpec, TaskInvocationSpec, TaskSpec, Workflow,
};
use windlass::domain::ports::TaskApi;
use windlass::domain::DomainResult;
use windlass::{ControllerDeps, ControllerMetrics, InvocationController};

/// Task api that marks tasks dispatched on the store and records every
/// invoke, leaving task completion to the test.
pub struct RecordingTaskApi {
    store: Arc<InMemoryInvocationStore>,
    invoked: Mutex<Vec<TaskInvocationSpec>>,
}

impl RecordingTaskApi {
    pub fn new(store: Arc<InMemoryInvocationStore>) -> Self {
        Self {
            store,
            invoked: Mutex::new(Vec::new()),
        }
    }

    pub async fn invoked(&self) -> Vec<TaskInvocationSpec> {
        self.invoked.lock().await.clone()
    }

    pub async fn invoked_task_ids(&self) -> Vec<String> {
        self.invoked
            .lock()
            .await
            .iter()
            .map(|spec| spec.task_id.clone())
            .collect()
    }
}

#[async_trait]
impl TaskApi for RecordingTaskApi {
    async fn invoke(&self, spec: TaskInvocationSpec) -> DomainResult<Uuid> {
        self.store
            .mark_task_scheduled(spec.invocation_id, &spec.task_id)
            .await?;
        self.invoked.lock().await.push(spec);
        Ok(Uuid::new_v4())
    }
}

/// Fully wired controller over the in-memory adapters.
pub struct Harness {
    pub controller: Arc<InvocationController>,
    pub invocations: Arc<InMemoryInvocationStore>,
    pub workflows: Arc<InMemoryWorkflowCache>,
    pub expressions: Arc<InMemoryExpressionStore>,
    pub task_api: Arc<RecordingTaskApi>,
}

impl Harness {
    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        self.controller.metrics()
    }

    /// Build and submit an invocation referencing the workflow by id only,
    /// forcing resolution through the workflow cache.
    pub async fn submit_invocation(&self, workflow: &Workflow) -> Uuid {
        self.invocations
            .submit(Invocation::new(InvocationSpec::new(workflow.id)))
            .await
    }
}

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        max_parallel_executions: 16,
        // Long tick interval: tests drive the sweeper through tick()
        // directly, so the background clock stays out of the way.
        tick_interval_ms: 60_000,
        ..ControllerConfig::default()
    }
}

pub async fn harness_with(config: ControllerConfig) -> Harness {
    let invocations = Arc::new(InMemoryInvocationStore::new());
    let workflows = Arc::new(InMemoryWorkflowCache::new());
    let expressions = Arc::new(InMemoryExpressionStore::new());
    let task_api = Arc::new(RecordingTaskApi::new(invocations.clone()));

    let deps = ControllerDeps {
        invocations: invocations.clone(),
        workflows: workflows.clone(),
        expressions: expressions.clone(),
        scheduler: Arc::new(DependencyScheduler),
        executor: Arc::new(InMemoryTaskExecutor::new()),
        invocation_api: invocations.clone(),
        task_api: task_api.clone(),
    };
    let metrics = Arc::new(ControllerMetrics::unregistered());
    let controller = Arc::new(InvocationController::new(config, deps, metrics));

    Harness {
        controller,
        invocations,
        workflows,
        expressions,
        task_api,
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

/// Single task `t1` with no dependencies; `t1` is the output task.
pub fn single_task_workflow() -> Workflow {
    let mut tasks = HashMap::new();
    tasks.insert("t1".to_string(), TaskSpec::new("fn-t1"));
    Workflow::new(tasks, "t1")
}

/// Two tasks where `b` requires `a`; `b` is the output task.
pub fn chained_workflow() -> Workflow {
    let mut tasks = HashMap::new();
    tasks.insert("a".to_string(), TaskSpec::new("fn-a"));
    tasks.insert("b".to_string(), TaskSpec::new("fn-b").requires("a"));
    Workflow::new(tasks, "b")
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

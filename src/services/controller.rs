//! The invocation controller.
//!
//! Event-driven control loop with at-most-one-in-flight evaluation per
//! invocation. Notifications from the invocation cache fan into the work
//! queue; a bounded worker pool drains the queue into `evaluate`; the
//! recovery sweeper repairs dropped notifications on a tick cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    ActionKind, CacheNotification, ControllerConfig, EvalOutcome, EvalRecord, Invocation,
    InvocationLifecycle, NotificationKind, Workflow,
};
use crate::domain::ports::{
    ExpressionStore, GroupJob, InvocationApi, InvocationCache, TaskApi, TaskExecutor,
    WorkflowCache, WorkflowScheduler,
};
use crate::infrastructure::metrics::{ControllerMetrics, EvalJobOutcome, RecoverySource};
use crate::services::eval_store::{EvalState, EvalStore};
use crate::services::rules::{default_policy, EvalContext, RuleChain};
use crate::services::work_queue::{BackoffPolicy, WorkQueue};
use crate::services::worker_pool::WorkerPool;

/// External collaborators of the controller, injected at construction.
#[derive(Clone)]
pub struct ControllerDeps {
    pub invocations: Arc<dyn InvocationCache>,
    pub workflows: Arc<dyn WorkflowCache>,
    pub expressions: Arc<dyn ExpressionStore>,
    pub scheduler: Arc<dyn WorkflowScheduler>,
    pub executor: Arc<dyn TaskExecutor>,
    pub invocation_api: Arc<dyn InvocationApi>,
    pub task_api: Arc<dyn TaskApi>,
}

/// Drives live invocations from submission to a terminal state.
pub struct InvocationController {
    config: ControllerConfig,
    deps: ControllerDeps,
    store: Arc<EvalStore>,
    queue: WorkQueue,
    pool: Arc<WorkerPool>,
    policy: Arc<RuleChain>,
    metrics: Arc<ControllerMetrics>,
    running: AtomicBool,
    ticks: AtomicU64,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl InvocationController {
    /// Build a controller with the default rule-chain policy.
    ///
    /// The api handles are constructed by the caller and threaded into the
    /// rule constructors here, before the resulting policy is attached to
    /// the controller.
    pub fn new(
        config: ControllerConfig,
        deps: ControllerDeps,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let policy = Arc::new(default_policy(
            deps.invocation_api.clone(),
            deps.task_api.clone(),
            deps.scheduler.clone(),
            deps.expressions.clone(),
            metrics.clone(),
            config.default_invocation_timeout(),
            config.max_error_count,
        ));
        let queue = WorkQueue::new(BackoffPolicy {
            base_delay: config.backoff_base_delay(),
            max_delay: config.backoff_max_delay(),
        });
        let pool = Arc::new(WorkerPool::new(config.max_parallel_executions));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            deps,
            store: Arc::new(EvalStore::new()),
            queue,
            pool,
            policy,
            metrics,
            running: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the policy. Intended for tests and custom deployments.
    pub fn with_policy(mut self, policy: RuleChain) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn eval_store(&self) -> &Arc<EvalStore> {
        &self.store
    }

    pub fn work_queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the notification listener, the queue dispatcher, and the
    /// sweeper clock driver. Idempotent.
    pub async fn init(self: Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            max_parallel = self.config.max_parallel_executions,
            short_loop = self.config.short_loop_period,
            long_loop = self.config.long_loop_period,
            "invocation controller starting"
        );

        let listener = Self::spawn_listener(self.clone());
        let dispatcher = Self::spawn_dispatcher(self.clone());
        let clock = Self::spawn_clock_driver(self.clone());
        *self.tasks.lock().await = vec![listener, dispatcher, clock];
    }

    /// Stop intake, drain the worker pool within the configured grace
    /// period, and close the evaluation store.
    pub async fn close(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("invocation controller stopping");
        let _ = self.shutdown.send(true);
        self.queue.shutdown().await;
        self.pool
            .graceful_stop(self.config.graceful_stop_timeout())
            .await;
        self.store.close().await;

        for mut handle in self.tasks.lock().await.drain(..) {
            if tokio::time::timeout(std::time::Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }
        info!("invocation controller stopped");
    }

    fn spawn_listener(controller: Arc<Self>) -> JoinHandle<()> {
        let mut rx = controller.deps.invocations.subscribe();
        let mut shutdown = controller.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Ok(notification) => controller.notify(notification).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            // Dropped notifications are repaired by the
                            // recovery sweeper.
                            warn!(missed, "notification stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("notification listener stopped");
        })
    }

    fn spawn_dispatcher(controller: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(invocation_id) = controller.queue.get().await {
                controller
                    .metrics
                    .set_queue_size(controller.queue.len().await);
                let ctl = controller.clone();
                let submitted = controller
                    .pool
                    .submit(async move {
                        ctl.evaluate(invocation_id).await;
                        ctl.queue.done(invocation_id).await;
                    })
                    .await;
                if let Err(DomainError::PoolClosed) = submitted {
                    controller.queue.done(invocation_id).await;
                    break;
                }
            }
            debug!("queue dispatcher stopped");
        })
    }

    fn spawn_clock_driver(controller: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown = controller.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(controller.config.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        let n = controller.ticks.fetch_add(1, Ordering::AcqRel) + 1;
                        controller.tick(n).await;
                    }
                }
            }
            debug!("clock driver stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Notification fan-in
    // -----------------------------------------------------------------------

    /// Route one cache notification.
    ///
    /// Called from the single-threaded listener so terminal-vs-progress
    /// ordering per invocation is preserved; concurrency is regained at the
    /// worker pool.
    pub async fn notify(&self, notification: CacheNotification) {
        let invocation_id = notification.invocation_id;
        match &notification.kind {
            kind if kind.is_terminal() => {
                let success = matches!(kind, NotificationKind::InvocationCompleted);
                self.finish_and_delete(invocation_id, success, kind.as_str().to_string())
                    .await;
            }
            kind if kind.is_progress() => {
                let span = notification.span.clone().unwrap_or_else(|| {
                    info_span!("invocation", invocation_id = %invocation_id)
                });
                self.store.load_or_store(invocation_id, span).await;
                self.queue.add(invocation_id).await;
                self.metrics.set_queue_size(self.queue.len().await);
            }
            kind => {
                debug!(event = kind.as_str(), %invocation_id, "ignoring notification");
            }
        }
    }

    /// Finish the evaluation state and drop it, together with the
    /// invocation's expression scratch.
    async fn finish_and_delete(&self, invocation_id: Uuid, success: bool, reason: String) {
        let Some(state) = self.store.load(invocation_id).await else {
            // Already finished through another path; nothing to tear down.
            self.deps.expressions.delete(invocation_id).await;
            return;
        };
        state.finish(success, reason).await;
        self.store.delete(invocation_id).await;
        self.deps.expressions.delete(invocation_id).await;

        if let Ok(invocation) = self.deps.invocations.get(invocation_id).await {
            self.metrics
                .record_invocation_status(invocation.status.lifecycle.as_str());
            let elapsed = Utc::now().signed_duration_since(invocation.created_at);
            let seconds = elapsed
                .num_microseconds()
                .map_or_else(|| elapsed.num_seconds() as f64, |us| us as f64 / 1e6);
            self.metrics.observe_invocation_duration(seconds);
        }
    }

    // -----------------------------------------------------------------------
    // Recovery sweeper
    // -----------------------------------------------------------------------

    /// Advance the sweeper. Normally called by the internal clock driver;
    /// public so tests and external clock sources can drive it directly.
    pub async fn tick(&self, n: u64) {
        if self.config.short_loop_period > 0 && n % self.config.short_loop_period == 0 {
            self.sweep_eval_store().await;
        }
        if self.config.long_loop_period > 0 && n % self.config.long_loop_period == 0 {
            self.sweep_cache().await;
        }
    }

    /// Short loop: re-enqueue live states whose evaluation went stale.
    async fn sweep_eval_store(&self) {
        let threshold = chrono::Duration::milliseconds(self.config.eval_stale_threshold_ms as i64);
        for state in self.store.list().await {
            if state.is_finished() {
                continue;
            }
            // Held token means an evaluation is in flight right now.
            let Some(_guard) = state.try_acquire() else {
                continue;
            };
            let last_seen = state
                .last()
                .await
                .map_or(state.created_at(), |record| record.timestamp);
            if Utc::now().signed_duration_since(last_seen) > threshold {
                debug!(invocation_id = %state.invocation_id(), "re-enqueueing stale evaluation");
                self.queue.add(state.invocation_id()).await;
                self.metrics.record_recovered(RecoverySource::EvalStore);
            }
        }
    }

    /// Long loop: rediscover live invocations the store has no state for.
    ///
    /// Covers startup, missed subscriptions, and cache-only re-derivations.
    async fn sweep_cache(&self) {
        let invocations = match self.deps.invocations.list().await {
            Ok(invocations) => invocations,
            Err(err) => {
                warn!(error = %err, "cache sweep failed to list invocations");
                return;
            }
        };
        for invocation in invocations {
            if invocation.is_terminal() {
                continue;
            }
            if self.store.load(invocation.id).await.is_some() {
                continue;
            }
            let span = info_span!("invocation", invocation_id = %invocation.id, recovered = true);
            self.store.load_or_store(invocation.id, span).await;
            self.queue.add(invocation.id).await;
            self.metrics.record_recovered(RecoverySource::Cache);
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Evaluate one invocation. Best-effort: every failure records its
    /// outcome, releases the token, and returns; recovery is the sweeper's
    /// job.
    pub async fn evaluate(&self, invocation_id: Uuid) {
        // 1. Look up the evaluation state.
        let Some(state) = self.store.load(invocation_id).await else {
            warn!(%invocation_id, "no evaluation state for queued invocation");
            self.metrics.record_eval_job(EvalJobOutcome::Noop);
            return;
        };

        // 2. Acquire the token or leave. This is the single point that
        // enforces at-most-one-in-flight per invocation.
        let Some(_guard) = state.try_acquire() else {
            self.metrics.record_eval_job(EvalJobOutcome::Duplicate);
            return;
        };
        if state.is_finished() {
            self.metrics.record_eval_job(EvalJobOutcome::Noop);
            return;
        }

        let span = info_span!(parent: &state.span(), "evaluate", %invocation_id);
        let started = Instant::now();
        async {
            // 3. Quiescence: the task executor is the source of truth for
            // in-flight work.
            let running = self.deps.executor.in_flight(invocation_id).await;
            if running > 0 {
                debug!(running, "invocation group still busy; deferring");
                self.metrics.record_eval_job(EvalJobOutcome::Noop);
                // The next task event re-triggers evaluation; the delayed
                // re-add covers events that complete without one.
                self.queue
                    .add_after(invocation_id, self.config.not_ready_requeue_delay());
                return;
            }

            // 4. Load the invocation snapshot.
            let invocation = match self.deps.invocations.get(invocation_id).await {
                Ok(invocation) => invocation,
                Err(err) => {
                    warn!(error = %err, "failed to load invocation snapshot");
                    state
                        .record(EvalRecord::error("evaluate/snapshot", err.to_string()))
                        .await;
                    self.metrics.record_eval_job(EvalJobOutcome::Error);
                    self.queue.add_rate_limited(invocation_id).await;
                    return;
                }
            };

            // 5. Already terminal: nothing left to drive.
            if invocation.is_terminal() {
                debug!(status = invocation.status.lifecycle.as_str(), "invocation already terminal");
                self.metrics.record_eval_job(EvalJobOutcome::Noop);
                self.finish_and_delete(
                    invocation_id,
                    invocation.status.lifecycle == InvocationLifecycle::Succeeded,
                    invocation.status.lifecycle.as_str().to_string(),
                )
                .await;
                return;
            }

            // 6. Resolve the workflow.
            let workflow = match self.resolve_workflow(&invocation).await {
                Ok(workflow) => workflow,
                Err(DomainError::WorkflowNotReady(workflow_id)) => {
                    debug!(%workflow_id, "workflow not ready; deferring");
                    self.defer_not_ready(&state, invocation_id).await;
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "failed to resolve workflow");
                    state
                        .record(EvalRecord::error("evaluate/workflow", err.to_string()))
                        .await;
                    self.metrics.record_eval_job(EvalJobOutcome::Error);
                    self.queue.add_rate_limited(invocation_id).await;
                    return;
                }
            };

            // 7. Run the rule chain.
            let ctx = EvalContext {
                state: state.clone(),
                invocation,
                workflow,
            };
            let decision = match self.policy.decide(&ctx).await {
                Ok(decision) => decision,
                Err(DomainError::WorkflowNotReady(workflow_id)) => {
                    debug!(%workflow_id, "workflow not ready; deferring");
                    self.defer_not_ready(&state, invocation_id).await;
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "rule chain failed");
                    state
                        .record(EvalRecord::error("evaluate/policy", err.to_string()))
                        .await;
                    self.metrics.record_eval_job(EvalJobOutcome::Error);
                    self.queue.add_rate_limited(invocation_id).await;
                    return;
                }
            };

            if decision.actions.is_empty() {
                state.record(EvalRecord::noop(decision.rule_path)).await;
                self.metrics.record_eval_job(EvalJobOutcome::Noop);
                self.metrics
                    .observe_eval_duration("noop", started.elapsed().as_secs_f64());
                self.queue.forget(invocation_id).await;
                return;
            }

            // 8. Submit actions under the invocation's group id, preserving
            // declared order.
            let kinds: Vec<ActionKind> = decision.actions.iter().map(|a| a.kind()).collect();
            for action in decision.actions {
                let kind = action.kind();
                let job: GroupJob = Box::pin(async move {
                    if let Err(err) = action.apply().await {
                        // The action was issued; the next cache event drives
                        // the follow-up evaluation.
                        warn!(error = %err, action = kind.as_str(), "action apply failed");
                    }
                });
                if let Err(err) = self.deps.executor.submit(invocation_id, job).await {
                    warn!(error = %err, "task executor rejected action");
                    state
                        .record(EvalRecord::error("evaluate/submit", err.to_string()))
                        .await;
                    self.metrics.record_eval_job(EvalJobOutcome::Error);
                    self.queue.add_rate_limited(invocation_id).await;
                    return;
                }
            }

            // 9. Record the evaluation and observe its duration.
            let kind_label = kinds.first().map_or("none", ActionKind::as_str);
            state
                .record(EvalRecord::actions(decision.rule_path, kinds))
                .await;
            self.metrics.record_eval_job(EvalJobOutcome::Action);
            self.metrics
                .observe_eval_duration(kind_label, started.elapsed().as_secs_f64());
            self.queue.forget(invocation_id).await;

            // 10. The actions may have finished the invocation already.
            if let Ok(current) = self.deps.invocations.get(invocation_id).await {
                if current.is_terminal() {
                    self.finish_and_delete(
                        invocation_id,
                        current.status.lifecycle == InvocationLifecycle::Succeeded,
                        current.status.lifecycle.as_str().to_string(),
                    )
                    .await;
                }
            }
        }
        .instrument(span)
        .await;
    }

    async fn resolve_workflow(&self, invocation: &Invocation) -> DomainResult<Workflow> {
        let workflow = match &invocation.spec.workflow {
            Some(embedded) => embedded.clone(),
            None => self.deps.workflows.get(invocation.spec.workflow_id).await?,
        };
        if !workflow.is_ready() {
            return Err(DomainError::WorkflowNotReady(workflow.id));
        }
        Ok(workflow)
    }

    /// Deferred re-enqueue for a not-ready workflow. Counts as an error
    /// outcome but deliberately appends no error record: readiness is a
    /// matter of time, not a strike against the invocation.
    async fn defer_not_ready(&self, state: &Arc<EvalState>, invocation_id: Uuid) {
        state
            .record(
                EvalRecord::new("evaluate/workflow_ready", EvalOutcome::Noop)
                    .with_cause("workflow not ready"),
            )
            .await;
        self.metrics.record_eval_job(EvalJobOutcome::Error);
        self.queue
            .add_after(invocation_id, self.config.not_ready_requeue_delay());
    }
}

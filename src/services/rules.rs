//! Rule-chain policy engine.
//!
//! A rule is a capability: inspect an evaluation context, produce zero or
//! more actions. The default policy is an evaluate-until-first-action chain
//! of the built-in rules, in priority order: deadline, error count,
//! completion, workflow readiness, scheduling. The chain combinator is
//! itself a rule, so policies nest.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Invocation, TaskInvocationSpec, TaskRunState, Workflow};
use crate::domain::ports::{ExpressionStore, InvocationApi, TaskApi, WorkflowScheduler};
use crate::infrastructure::metrics::ControllerMetrics;
use crate::services::actions::{Action, CompleteAction, FailAction, InvokeAction};
use crate::services::eval_store::EvalState;

/// Everything a rule may inspect: the controller's own state for the
/// invocation plus read-only snapshots of the aggregates.
pub struct EvalContext {
    pub state: Arc<EvalState>,
    pub invocation: Invocation,
    pub workflow: Workflow,
}

/// A policy capability: evaluate a context into actions.
#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect the context and emit actions. An empty list means "no
    /// opinion"; composite rules move on to the next sub-rule.
    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>>;
}

/// The verdict of a chain evaluation: which rule path decided, and what it
/// emitted.
pub struct Decision {
    pub rule_path: String,
    pub actions: Vec<Box<dyn Action>>,
}

impl Decision {
    pub fn noop(rule_path: impl Into<String>) -> Self {
        Self {
            rule_path: rule_path.into(),
            actions: Vec::new(),
        }
    }
}

/// Evaluate-until-first-action combinator.
pub struct RuleChain {
    name: &'static str,
    rules: Vec<Arc<dyn Rule>>,
}

impl RuleChain {
    pub fn new(name: &'static str, rules: Vec<Arc<dyn Rule>>) -> Self {
        Self { name, rules }
    }

    /// Run sub-rules in order and return the first non-empty action list
    /// together with the path of the rule that produced it.
    pub async fn decide(&self, ctx: &EvalContext) -> DomainResult<Decision> {
        for rule in &self.rules {
            let actions = rule.evaluate(ctx).await?;
            if !actions.is_empty() {
                return Ok(Decision {
                    rule_path: format!("{}/{}", self.name, rule.name()),
                    actions,
                });
            }
        }
        Ok(Decision::noop(self.name))
    }
}

#[async_trait]
impl Rule for RuleChain {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        Ok(self.decide(ctx).await?.actions)
    }
}

// ---------------------------------------------------------------------------
// Built-in rules
// ---------------------------------------------------------------------------

/// Fail invocations that outlived their deadline.
///
/// The spec deadline wins over the configured default. Runs first so an
/// expired invocation can never schedule further work.
pub struct DeadlineRule {
    pub invocation_api: Arc<dyn InvocationApi>,
    pub default_timeout: chrono::Duration,
}

#[async_trait]
impl Rule for DeadlineRule {
    fn name(&self) -> &'static str {
        "deadline"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        let expires_at = ctx.invocation.expires_at(self.default_timeout);
        if Utc::now() <= expires_at {
            return Ok(Vec::new());
        }
        warn!(
            invocation_id = %ctx.invocation.id,
            %expires_at,
            "invocation exceeded its deadline"
        );
        Ok(vec![Box::new(FailAction::new(
            self.invocation_api.clone(),
            ctx.invocation.id,
            "invocation timed out",
        ))])
    }
}

/// Fail invocations whose evaluation history accumulated too many errors.
///
/// With the default threshold of 0 a single error-outcome record fails the
/// invocation: deliberate fail-fast.
pub struct ErrorCountRule {
    pub invocation_api: Arc<dyn InvocationApi>,
    pub max_error_count: u32,
}

#[async_trait]
impl Rule for ErrorCountRule {
    fn name(&self) -> &'static str {
        "error_count"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        let errors = ctx.state.error_count().await;
        if errors <= self.max_error_count {
            return Ok(Vec::new());
        }
        let cause = ctx
            .state
            .last_error()
            .await
            .unwrap_or_else(|| "evaluation error threshold exceeded".to_string());
        warn!(
            invocation_id = %ctx.invocation.id,
            errors,
            max = self.max_error_count,
            "error count exceeded"
        );
        Ok(vec![Box::new(FailAction::new(
            self.invocation_api.clone(),
            ctx.invocation.id,
            cause,
        ))])
    }
}

/// Complete invocations whose task DAG has fully finished, and fail those
/// with a permanently failed task.
pub struct CompletionRule {
    pub invocation_api: Arc<dyn InvocationApi>,
}

#[async_trait]
impl Rule for CompletionRule {
    fn name(&self) -> &'static str {
        "completion"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        let invocation = &ctx.invocation;
        let workflow = &ctx.workflow;

        // A permanently failed task sinks the whole invocation.
        if let Some(failed) = invocation
            .status
            .tasks
            .values()
            .find(|run| run.state == TaskRunState::Failed)
        {
            let cause = failed
                .error
                .clone()
                .unwrap_or_else(|| format!("task {} failed", failed.task_id));
            return Ok(vec![Box::new(FailAction::new(
                self.invocation_api.clone(),
                invocation.id,
                cause,
            ))]);
        }

        let all_done = workflow.tasks.keys().all(|task_id| {
            invocation
                .task_run(task_id)
                .is_some_and(|run| run.state.is_terminal())
        });
        if !all_done {
            return Ok(Vec::new());
        }

        let output = invocation
            .task_run(&workflow.output_task)
            .and_then(|run| run.output.clone());
        match output {
            Some(output) => {
                debug!(invocation_id = %invocation.id, "workflow complete");
                Ok(vec![Box::new(CompleteAction::new(
                    self.invocation_api.clone(),
                    invocation.id,
                    output,
                ))])
            }
            None => {
                // Terminal tasks but no output from the output task: the
                // invocation can never produce a result.
                Ok(vec![Box::new(FailAction::new(
                    self.invocation_api.clone(),
                    invocation.id,
                    format!("output task {} produced no output", workflow.output_task),
                ))])
            }
        }
    }
}

/// Defer evaluation while the workflow definition is still resolving.
///
/// Surfaces as `WorkflowNotReady`, which the controller converts into a
/// delayed re-enqueue rather than an error record.
pub struct WorkflowReadyRule;

#[async_trait]
impl Rule for WorkflowReadyRule {
    fn name(&self) -> &'static str {
        "workflow_ready"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        if ctx.workflow.is_ready() {
            Ok(Vec::new())
        } else {
            Err(DomainError::WorkflowNotReady(ctx.workflow.id))
        }
    }
}

/// Translate the scheduler's plan into invoke actions.
///
/// Inputs are resolved against the invocation-scoped expression store; plan
/// order is preserved.
pub struct ScheduleRule {
    pub task_api: Arc<dyn TaskApi>,
    pub scheduler: Arc<dyn WorkflowScheduler>,
    pub expressions: Arc<dyn ExpressionStore>,
    pub metrics: Arc<ControllerMetrics>,
}

#[async_trait]
impl Rule for ScheduleRule {
    fn name(&self) -> &'static str {
        "schedule"
    }

    async fn evaluate(&self, ctx: &EvalContext) -> DomainResult<Vec<Box<dyn Action>>> {
        let invocation = &ctx.invocation;
        let workflow = &ctx.workflow;

        let plan = self.scheduler.schedule(invocation, workflow).await?;
        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let mut actions: Vec<Box<dyn Action>> = Vec::with_capacity(plan.run_tasks.len());
        for task_id in &plan.run_tasks {
            let spec = workflow.tasks.get(task_id).ok_or_else(|| {
                DomainError::SchedulerFailed(format!(
                    "plan references unknown task {task_id}"
                ))
            })?;

            let started = std::time::Instant::now();
            let inputs = self
                .expressions
                .resolve(invocation, task_id, &spec.inputs)
                .await?;
            self.metrics
                .observe_expression_duration(started.elapsed().as_secs_f64());

            let deadline = spec
                .timeout_secs
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
            actions.push(Box::new(InvokeAction::new(
                self.task_api.clone(),
                TaskInvocationSpec {
                    invocation_id: invocation.id,
                    task_id: task_id.clone(),
                    function: spec.function.clone(),
                    inputs,
                    deadline,
                },
            )));
        }
        debug!(
            invocation_id = %invocation.id,
            tasks = plan.run_tasks.len(),
            "scheduling plan translated"
        );
        Ok(actions)
    }
}

/// Build the default invocation policy.
///
/// Api handles are constructed first and passed in; the resulting chain is
/// then attached to the controller, which resolves the controller/rules
/// cycle at construction time.
pub fn default_policy(
    invocation_api: Arc<dyn InvocationApi>,
    task_api: Arc<dyn TaskApi>,
    scheduler: Arc<dyn WorkflowScheduler>,
    expressions: Arc<dyn ExpressionStore>,
    metrics: Arc<ControllerMetrics>,
    default_timeout: chrono::Duration,
    max_error_count: u32,
) -> RuleChain {
    RuleChain::new(
        "invocation",
        vec![
            Arc::new(DeadlineRule {
                invocation_api: invocation_api.clone(),
                default_timeout,
            }),
            Arc::new(ErrorCountRule {
                invocation_api: invocation_api.clone(),
                max_error_count,
            }),
            Arc::new(CompletionRule { invocation_api }),
            Arc::new(WorkflowReadyRule),
            Arc::new(ScheduleRule {
                task_api,
                scheduler,
                expressions,
                metrics,
            }),
        ],
    )
}

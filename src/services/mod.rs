//! Controller services: evaluation state, queueing, policy, orchestration.

pub mod actions;
pub mod controller;
pub mod eval_store;
pub mod rules;
pub mod work_queue;
pub mod worker_pool;

pub use actions::{Action, CompleteAction, FailAction, InvokeAction};
pub use controller::{ControllerDeps, InvocationController};
pub use eval_store::{EvalGuard, EvalState, EvalStore};
pub use rules::{
    default_policy, CompletionRule, DeadlineRule, Decision, ErrorCountRule, EvalContext, Rule,
    RuleChain, ScheduleRule, WorkflowReadyRule,
};
pub use work_queue::{BackoffPolicy, WorkQueue};
pub use worker_pool::WorkerPool;

//! Domain models for the Windlass invocation controller.

pub mod config;
pub mod eval;
pub mod invocation;
pub mod notification;
pub mod workflow;

pub use config::{Config, ControllerConfig, LoggingConfig};
pub use eval::{ActionKind, EvalOutcome, EvalRecord};
pub use invocation::{
    Invocation, InvocationLifecycle, InvocationSpec, InvocationStatus, TaskRun, TaskRunState,
};
pub use notification::{CacheNotification, NotificationKind};
pub use workflow::{
    SchedulingPlan, TaskInvocationSpec, TaskSpec, Workflow, WorkflowStatus,
};

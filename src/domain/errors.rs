//! Domain errors for the Windlass invocation controller.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors that can occur while driving invocations.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invocation not found: {0}")]
    InvocationNotFound(Uuid),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("Workflow {0} is not ready")]
    WorkflowNotReady(Uuid),

    #[error("Evaluation state not found: {0}")]
    EvalStateNotFound(Uuid),

    #[error("Worker pool is closed")]
    PoolClosed,

    #[error("Work queue is shut down")]
    QueueShutDown,

    #[error("Cache read failed: {0}")]
    CacheUnavailable(String),

    #[error("Scheduler failed: {0}")]
    SchedulerFailed(String),

    #[error("Expression resolution failed: {0}")]
    ExpressionFailed(String),

    #[error("API call failed: {0}")]
    ApiFailed(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

//! Windlass — invocation controller for a serverless workflow engine.
//!
//! The controller drives each active workflow invocation from submission to
//! a terminal state: it listens to invocation-cache updates, coalesces them
//! into a rate-limited work queue, evaluates invocations against a rule
//! chain under a per-invocation lock, and dispatches the resulting actions
//! (invoke task, fail, complete). A periodic sweeper repairs dropped
//! notifications and rediscovers orphaned invocations.

pub mod adapters;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::Config;
pub use infrastructure::metrics::ControllerMetrics;
pub use services::controller::{ControllerDeps, InvocationController};

//! Infrastructure: configuration, logging, metrics.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{ConfigError, ConfigLoader};
pub use logging::Logger;
pub use metrics::{ControllerMetrics, EvalJobOutcome, RecoverySource};

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration structure for Windlass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Invocation controller tuning.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tuning knobs for the invocation controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ControllerConfig {
    /// Worker pool concurrency ceiling.
    #[serde(default = "default_max_parallel_executions")]
    pub max_parallel_executions: usize,

    /// Re-enqueue an evaluation state when its last record is older than
    /// this many milliseconds.
    #[serde(default = "default_eval_stale_threshold_ms")]
    pub eval_stale_threshold_ms: u64,

    /// Ticks between short recovery sweeps over the evaluation store.
    #[serde(default = "default_short_loop_period")]
    pub short_loop_period: u64,

    /// Ticks between long recovery sweeps over the invocation cache.
    #[serde(default = "default_long_loop_period")]
    pub long_loop_period: u64,

    /// Global invocation deadline, overridable per spec.
    #[serde(default = "default_invocation_timeout_secs")]
    pub default_invocation_timeout_secs: u64,

    /// Error-kind records tolerated before the error-count rule fails the
    /// invocation. The default of 0 is deliberate fail-fast: one transient
    /// error surfaces as a permanent failure unless raised.
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,

    /// Drain budget for graceful shutdown, in seconds.
    #[serde(default = "default_graceful_stop_timeout_secs")]
    pub graceful_stop_timeout_secs: u64,

    /// Delay before re-evaluating an invocation whose workflow is not ready.
    #[serde(default = "default_not_ready_requeue_delay_ms")]
    pub not_ready_requeue_delay_ms: u64,

    /// Base delay of the per-key work queue backoff, in milliseconds.
    #[serde(default = "default_backoff_base_delay_ms")]
    pub backoff_base_delay_ms: u64,

    /// Ceiling of the per-key work queue backoff, in milliseconds.
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,

    /// Interval of the sweeper clock driver, in milliseconds.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

const fn default_max_parallel_executions() -> usize {
    1000
}

const fn default_eval_stale_threshold_ms() -> u64 {
    100
}

const fn default_short_loop_period() -> u64 {
    10
}

const fn default_long_loop_period() -> u64 {
    50
}

const fn default_invocation_timeout_secs() -> u64 {
    600
}

const fn default_max_error_count() -> u32 {
    0
}

const fn default_graceful_stop_timeout_secs() -> u64 {
    60
}

const fn default_not_ready_requeue_delay_ms() -> u64 {
    100
}

const fn default_backoff_base_delay_ms() -> u64 {
    5
}

const fn default_backoff_max_delay_ms() -> u64 {
    1000
}

const fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_parallel_executions: default_max_parallel_executions(),
            eval_stale_threshold_ms: default_eval_stale_threshold_ms(),
            short_loop_period: default_short_loop_period(),
            long_loop_period: default_long_loop_period(),
            default_invocation_timeout_secs: default_invocation_timeout_secs(),
            max_error_count: default_max_error_count(),
            graceful_stop_timeout_secs: default_graceful_stop_timeout_secs(),
            not_ready_requeue_delay_ms: default_not_ready_requeue_delay_ms(),
            backoff_base_delay_ms: default_backoff_base_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl ControllerConfig {
    pub fn eval_stale_threshold(&self) -> Duration {
        Duration::from_millis(self.eval_stale_threshold_ms)
    }

    pub fn default_invocation_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.default_invocation_timeout_secs as i64)
    }

    pub fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    pub fn not_ready_requeue_delay(&self) -> Duration {
        Duration::from_millis(self.not_ready_requeue_delay_ms)
    }

    pub fn backoff_base_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_base_delay_ms)
    }

    pub fn backoff_max_delay(&self) -> Duration {
        Duration::from_millis(self.backoff_max_delay_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset.
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

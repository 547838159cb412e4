use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_parallel_executions: {0}. Must be at least 1")]
    InvalidMaxParallelExecutions(usize),

    #[error("Invalid {0}: loop periods must be at least 1 tick")]
    InvalidLoopPeriod(&'static str),

    #[error(
        "Invalid backoff configuration: base_delay_ms ({0}) must not exceed max_delay_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid tick_interval_ms: {0}. Must be positive")]
    InvalidTickInterval(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .windlass/config.yaml (project config)
    /// 3. .windlass/local.yaml (project local overrides, optional)
    /// 4. Environment variables (WINDLASS_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".windlass/config.yaml"))
            .merge(Yaml::file(".windlass/local.yaml"))
            .merge(Env::prefixed("WINDLASS_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let controller = &config.controller;

        if controller.max_parallel_executions == 0 {
            return Err(ConfigError::InvalidMaxParallelExecutions(
                controller.max_parallel_executions,
            ));
        }

        if controller.short_loop_period == 0 {
            return Err(ConfigError::InvalidLoopPeriod("short_loop_period"));
        }
        if controller.long_loop_period == 0 {
            return Err(ConfigError::InvalidLoopPeriod("long_loop_period"));
        }

        if controller.backoff_base_delay_ms > controller.backoff_max_delay_ms {
            return Err(ConfigError::InvalidBackoff(
                controller.backoff_base_delay_ms,
                controller.backoff_max_delay_ms,
            ));
        }

        if controller.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidTickInterval(controller.tick_interval_ms));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ControllerConfig, LoggingConfig};
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn rejects_zero_pool_ceiling() {
        let config = Config {
            controller: ControllerConfig {
                max_parallel_executions: 0,
                ..ControllerConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMaxParallelExecutions(0))
        ));
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = Config {
            controller: ControllerConfig {
                backoff_base_delay_ms: 2000,
                backoff_max_delay_ms: 100,
                ..ControllerConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(2000, 100))
        ));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let config = Config {
            logging: LoggingConfig {
                level: "verbose".to_string(),
                ..LoggingConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "controller:\n  max_parallel_executions: 8\n  max_error_count: 3"
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.controller.max_parallel_executions, 8);
        assert_eq!(config.controller.max_error_count, 3);
        // Untouched fields keep their defaults.
        assert_eq!(config.controller.short_loop_period, 10);
    }
}

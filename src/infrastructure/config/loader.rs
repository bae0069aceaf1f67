use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project directory holding config, database and corpus.
pub const PROJECT_DIR: &str = ".portrait";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Invalid transport backend: {0}. Must be one of: sqlite, memory")]
    InvalidTransportBackend(String),

    #[error("Invalid partitions: {0}. Must be between 1 and 256")]
    InvalidPartitions(u32),

    #[error("Invalid oracle backend: {0}. Must be one of: http, mock")]
    InvalidOracleBackend(String),

    #[error("Invalid rate limit: {0}. Must be positive")]
    InvalidRateLimit(u32),

    #[error("Invalid burst_size: {0}. Must be at least 1")]
    InvalidBurstSize(u32),

    #[error("Invalid max_attempts: {0}. Cannot be 0")]
    InvalidMaxAttempts(u32),

    #[error("Invalid backoff configuration: base ({0}ms) must not exceed cap ({1}ms)")]
    InvalidBackoff(u64, u64),

    #[error("Invalid multiplier for {0}: {1}. Must be at least 1.0")]
    InvalidMultiplier(&'static str, f64),

    #[error("Invalid fatigue thresholds: medium ({0}) must be below high ({1}), both within (0, 1]")]
    InvalidFatigueThresholds(f64, f64),

    #[error("Invalid pause bounds: min ({0}) must not exceed max ({1})")]
    InvalidPauseBounds(u32, u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .portrait/config.yaml (project config, created by init)
    /// 3. .portrait/local.yaml (project local overrides, optional)
    /// 4. Environment variables (PORTRAIT_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(format!("{PROJECT_DIR}/config.yaml")))
            .merge(Yaml::file(format!("{PROJECT_DIR}/local.yaml")))
            .merge(Env::prefixed("PORTRAIT_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("PORTRAIT_").split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise from the project hierarchy.
    pub fn load_optional(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        if !["json", "pretty"].contains(&config.logging.format.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }
        if !["daily", "hourly", "never"].contains(&config.logging.rotation.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        if !["sqlite", "memory"].contains(&config.transport.backend.as_str()) {
            return Err(ConfigError::InvalidTransportBackend(config.transport.backend.clone()));
        }
        if config.transport.partitions == 0 || config.transport.partitions > 256 {
            return Err(ConfigError::InvalidPartitions(config.transport.partitions));
        }
        if config.transport.read_batch_size == 0 || config.relay.batch_size == 0 {
            return Err(ConfigError::ValidationFailed("batch sizes must be at least 1".to_string()));
        }

        if !["http", "mock"].contains(&config.oracle.backend.as_str()) {
            return Err(ConfigError::InvalidOracleBackend(config.oracle.backend.clone()));
        }
        if config.oracle.requests_per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(config.oracle.requests_per_second));
        }
        if config.oracle.burst_size == 0 {
            return Err(ConfigError::InvalidBurstSize(config.oracle.burst_size));
        }
        if config.oracle.timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed("oracle.timeout_ms must be positive".to_string()));
        }

        if config.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(config.retry.max_attempts));
        }
        if config.retry.base_delay_ms > config.retry.max_delay_ms {
            return Err(ConfigError::InvalidBackoff(config.retry.base_delay_ms, config.retry.max_delay_ms));
        }
        if config.relay.initial_backoff_ms > config.relay.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                config.relay.initial_backoff_ms,
                config.relay.max_backoff_ms,
            ));
        }
        for (name, multiplier) in [
            ("retry", config.retry.multiplier),
            ("relay", config.relay.backoff_multiplier),
            ("circuit_breaker", config.circuit_breaker.cooldown_multiplier),
        ] {
            if !(multiplier.is_finite() && multiplier >= 1.0) {
                return Err(ConfigError::InvalidMultiplier(name, multiplier));
            }
        }

        let breaker = &config.circuit_breaker;
        if breaker.consecutive_failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "circuit_breaker.consecutive_failure_threshold must be at least 1".to_string(),
            ));
        }
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "circuit_breaker.failure_rate_threshold must be within (0, 1]".to_string(),
            ));
        }

        let fatigue = &config.fatigue;
        if !(fatigue.medium_threshold > 0.0
            && fatigue.medium_threshold < fatigue.high_threshold
            && fatigue.high_threshold <= 1.0)
        {
            return Err(ConfigError::InvalidFatigueThresholds(
                fatigue.medium_threshold,
                fatigue.high_threshold,
            ));
        }
        if fatigue.min_pause_minutes > fatigue.max_pause_minutes {
            return Err(ConfigError::InvalidPauseBounds(
                fatigue.min_pause_minutes,
                fatigue.max_pause_minutes,
            ));
        }
        if fatigue.window < 2 {
            return Err(ConfigError::ValidationFailed("fatigue.window must be at least 2".to_string()));
        }

        if !(1..=5).contains(&config.session.default_min_safety_level) {
            return Err(ConfigError::ValidationFailed(
                "session.default_min_safety_level must be within 1-5".to_string(),
            ));
        }

        Ok(())
    }
}

//! Engine configuration.
//!
//! Defaults match the documented behavior of each subsystem; every value
//! can be overridden from the environment with `HODEI_`-prefixed
//! variables. Invalid values fail loudly at startup rather than being
//! silently replaced.

use std::time::Duration;

use thiserror::Error;

use crate::artifacts::cache::CompressionKind;
use crate::coordinator::CoordinatorConfig;
use crate::scheduler::queue::SchedulingStrategy;

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable holds an unusable value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Cross-field validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the orchestration engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Queue settings
    /// Maximum number of queued jobs.
    pub queue_max_size: usize,
    /// Ranking strategy of the queue.
    pub queue_strategy: SchedulingStrategy,

    // Placement settings
    /// Default placement strategy name.
    pub placement_strategy: String,

    // Session settings
    /// Interval workers are told to heartbeat at.
    pub heartbeat_interval: Duration,

    // Worker settings
    /// Endpoint handed to workers so they can dial back.
    pub server_endpoint: String,
    /// Image used for provisioned workers.
    pub worker_image: String,

    // Coordinator settings
    /// Scheduler tick when no wakeups fire.
    pub tick_interval: Duration,
    /// Grace period for cancelled executions.
    pub grace_period: Duration,
    /// Idle-worker retention window; zero releases workers immediately.
    pub worker_reuse_window: Duration,
    /// Log lines retained per execution.
    pub log_tail_lines: usize,

    // Artifact settings
    /// Artifact cache bound in bytes.
    pub artifact_cache_bytes: u64,
    /// Chunk payload size for artifact streaming.
    pub artifact_chunk_size: usize,
    /// Compression for streamed artifact chunks.
    pub artifact_compression: CompressionKind,

    // Event settings
    /// Per-subscriber event backlog bound.
    pub event_backlog: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_max_size: 10_000,
            queue_strategy: SchedulingStrategy::PriorityBased,
            placement_strategy: "leastloaded".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            server_endpoint: "https://localhost:7000".to_string(),
            worker_image: "hodei/worker:latest".to_string(),
            tick_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(30),
            worker_reuse_window: Duration::from_secs(300),
            log_tail_lines: 100,
            artifact_cache_bytes: 512 * 1024 * 1024,
            artifact_chunk_size: 64 * 1024,
            artifact_compression: CompressionKind::Gzip,
            event_backlog: 1000,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the environment on top of the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = read_env("HODEI_QUEUE_MAX_SIZE")? {
            config.queue_max_size = parse_number("HODEI_QUEUE_MAX_SIZE", &value)?;
        }
        if let Ok(value) = std::env::var("HODEI_QUEUE_STRATEGY") {
            config.queue_strategy = SchedulingStrategy::from_name(&value);
        }
        if let Ok(value) = std::env::var("HODEI_PLACEMENT_STRATEGY") {
            config.placement_strategy = value;
        }
        if let Some(value) = read_env("HODEI_HEARTBEAT_INTERVAL_SECONDS")? {
            config.heartbeat_interval =
                Duration::from_secs(parse_number("HODEI_HEARTBEAT_INTERVAL_SECONDS", &value)?);
        }
        if let Ok(value) = std::env::var("HODEI_SERVER_ENDPOINT") {
            config.server_endpoint = value;
        }
        if let Ok(value) = std::env::var("HODEI_WORKER_IMAGE") {
            config.worker_image = value;
        }
        if let Some(value) = read_env("HODEI_TICK_INTERVAL_MS")? {
            config.tick_interval =
                Duration::from_millis(parse_number("HODEI_TICK_INTERVAL_MS", &value)?);
        }
        if let Some(value) = read_env("HODEI_GRACE_PERIOD_SECONDS")? {
            config.grace_period =
                Duration::from_secs(parse_number("HODEI_GRACE_PERIOD_SECONDS", &value)?);
        }
        if let Some(value) = read_env("HODEI_WORKER_REUSE_SECONDS")? {
            config.worker_reuse_window =
                Duration::from_secs(parse_number("HODEI_WORKER_REUSE_SECONDS", &value)?);
        }
        if let Some(value) = read_env("HODEI_LOG_TAIL_LINES")? {
            config.log_tail_lines = parse_number("HODEI_LOG_TAIL_LINES", &value)?;
        }
        if let Some(value) = read_env("HODEI_ARTIFACT_CACHE_BYTES")? {
            config.artifact_cache_bytes = parse_number("HODEI_ARTIFACT_CACHE_BYTES", &value)?;
        }
        if let Some(value) = read_env("HODEI_ARTIFACT_CHUNK_SIZE")? {
            config.artifact_chunk_size = parse_number("HODEI_ARTIFACT_CHUNK_SIZE", &value)?;
        }
        if let Ok(value) = std::env::var("HODEI_ARTIFACT_COMPRESSION") {
            config.artifact_compression = match value.to_ascii_lowercase().as_str() {
                "none" => CompressionKind::None,
                "gzip" => CompressionKind::Gzip,
                "zstd" => CompressionKind::Zstd,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "HODEI_ARTIFACT_COMPRESSION".to_string(),
                        message: format!("unknown compression '{other}'"),
                    })
                }
            };
        }
        if let Some(value) = read_env("HODEI_EVENT_BACKLOG")? {
            config.event_backlog = parse_number("HODEI_EVENT_BACKLOG", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "queue_max_size must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.artifact_chunk_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "artifact_chunk_size must be positive".to_string(),
            ));
        }
        if self.event_backlog == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_backlog must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The coordinator section of this configuration.
    pub fn coordinator(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            tick_interval: self.tick_interval,
            grace_period: self.grace_period,
            worker_reuse_window: self.worker_reuse_window,
            log_tail_lines: self.log_tail_lines,
            artifact_chunk_size: self.artifact_chunk_size,
            artifact_compression: self.artifact_compression,
        }
    }
}

fn read_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(_) => Ok(None),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

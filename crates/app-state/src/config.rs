//! Sync configuration
//!
//! Every knob of the offline core in one serde struct. Missing fields fall
//! back to their defaults, so a config file only needs what it changes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use networking::{ExponentialRetry, QualityThresholds};
use storage::{CacheConfig, RetryLimits};

use crate::conflict::ConflictStrategy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON for [`SyncConfig`]
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Offline core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts allowed per priority tier
    pub retry_limits: RetryLimits,
    /// Backoff delay after the first failure, in milliseconds
    pub backoff_base_ms: u64,
    /// Upper bound for backoff delays, in milliseconds
    pub backoff_cap_ms: u64,
    /// Timeout for a single backend request, in milliseconds
    pub request_timeout_ms: u64,
    /// Interval between periodic sync passes, in seconds
    pub sync_interval_secs: u64,
    /// Default query cache TTL, in seconds
    pub cache_ttl_secs: u64,
    /// TTL of raw responses kept for offline reads, in seconds
    pub api_cache_ttl_secs: u64,
    /// Query cache storage quota, in bytes
    pub cache_quota_bytes: usize,
    /// Fraction of the quota above which cleanup evicts
    pub cache_pressure_threshold: f64,
    /// Maximum number of cached query results
    pub cache_max_entries: usize,
    /// How conflicts are settled
    pub conflict_strategy: ConflictStrategy,
    /// Latency below which the link is excellent, in milliseconds
    pub excellent_latency_ms: u64,
    /// Latency below which the link is good, in milliseconds
    pub good_latency_ms: u64,
    /// Interval between latency probes, in seconds
    pub probe_interval_secs: u64,
    /// Payload size above which non-critical writes wait for a better link
    pub poor_link_payload_limit: usize,
    /// How long completed operations stay in the queue, in seconds
    pub completed_retention_secs: u64,
    /// Maximum number of sync log entries kept
    pub sync_log_max_entries: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_limits: RetryLimits::default(),
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            request_timeout_ms: 15_000,
            sync_interval_secs: 60,
            cache_ttl_secs: 300,
            api_cache_ttl_secs: 86_400,
            cache_quota_bytes: 10 * 1024 * 1024, // 10MB
            cache_pressure_threshold: 0.8,
            cache_max_entries: 1000,
            conflict_strategy: ConflictStrategy::default(),
            excellent_latency_ms: 100,
            good_latency_ms: 300,
            probe_interval_secs: 30,
            poor_link_payload_limit: 64 * 1024,
            completed_retention_secs: 3600,
            sync_log_max_entries: 1000,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON config
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json_str(&contents)?;
        tracing::info!(path = %path.as_ref().display(), "Loaded sync configuration");
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.cache_pressure_threshold) {
            return Err(ConfigError::Invalid(format!(
                "cache_pressure_threshold must be within 0..=1, got {}",
                self.cache_pressure_threshold
            )));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "backoff_cap_ms must not be smaller than backoff_base_ms".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".to_string()));
        }
        if self.sync_interval_secs == 0 || self.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".to_string()));
        }
        if self.excellent_latency_ms > self.good_latency_ms {
            return Err(ConfigError::Invalid(
                "excellent_latency_ms must not exceed good_latency_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff policy
    pub fn backoff(&self) -> ExponentialRetry {
        ExponentialRetry::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Periodic sync interval
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Latency probe interval
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    /// Retention of completed operations
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    /// TTL for raw responses kept for offline reads
    pub fn api_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.api_cache_ttl_secs)
    }

    /// Query cache configuration
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .default_ttl(Duration::from_secs(self.cache_ttl_secs))
            .quota_bytes(self.cache_quota_bytes)
            .pressure_threshold(self.cache_pressure_threshold)
            .max_entries(self.cache_max_entries)
    }

    /// Link quality thresholds
    pub fn quality_thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            excellent: Duration::from_millis(self.excellent_latency_ms),
            good: Duration::from_millis(self.good_latency_ms),
        }
    }
}

//! Engine configuration.
//!
//! Loaded from JSON (every field optional), optionally overridden from the
//! environment, and validated once when the graph is built. Any violation is
//! a fatal [`ConfigError`].

use crate::checkpoint::CheckpointConfig;
use crate::core::StageName;
use crate::errors::ConfigError;
use crate::models::QualityThresholds;
use crate::resilience::{BackoffConfig, BreakerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Ceiling on repair passes regardless of configuration.
pub const GLOBAL_MAX_ITERATIONS: u32 = 10;

/// Environment override for `max_iterations`.
pub const ENV_MAX_ITERATIONS: &str = "FORGEFLOW_MAX_ITERATIONS";
/// Environment override for `checkpoint.dir`.
pub const ENV_CHECKPOINT_DIR: &str = "FORGEFLOW_CHECKPOINT_DIR";
/// Environment override for `default_stage_timeout_secs`.
pub const ENV_STAGE_TIMEOUT_SECS: &str = "FORGEFLOW_STAGE_TIMEOUT_SECS";
/// Environment override for `circuit_breaker.failure_threshold`.
pub const ENV_BREAKER_FAILURE_THRESHOLD: &str = "FORGEFLOW_BREAKER_FAILURE_THRESHOLD";

fn default_max_iterations() -> u32 {
    3
}

fn default_stage_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_stages() -> usize {
    8
}

fn default_event_buffer() -> usize {
    256
}

fn default_event_send_timeout_ms() -> u64 {
    1000
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound on repair passes per task.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Per-stage timeouts in seconds.
    #[serde(default)]
    pub stage_timeouts: HashMap<StageName, u64>,
    /// Timeout for stages without an entry in `stage_timeouts`.
    #[serde(default = "default_stage_timeout_secs")]
    pub default_stage_timeout_secs: u64,
    /// Circuit breaker thresholds, shared by every stage.
    #[serde(default)]
    pub circuit_breaker: BreakerConfig,
    /// Model quality floors.
    #[serde(default)]
    pub quality_thresholds: QualityThresholds,
    /// Checkpoint settings.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Stage calls allowed in flight across all tasks.
    #[serde(default = "default_max_concurrent_stages")]
    pub max_concurrent_stages: usize,
    /// Capacity of progress channels.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// How long a progress event waits for channel capacity before it is
    /// dropped. Terminal events always wait.
    #[serde(default = "default_event_send_timeout_ms")]
    pub event_send_timeout_ms: u64,
    /// Light general-purpose model used late in the fallback chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_model: Option<String>,
    /// Pacing between fallback attempts.
    #[serde(default)]
    pub fallback_backoff: BackoffConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stage_timeouts: HashMap::new(),
            default_stage_timeout_secs: default_stage_timeout_secs(),
            circuit_breaker: BreakerConfig::default(),
            quality_thresholds: QualityThresholds::default(),
            checkpoint: CheckpointConfig::default(),
            max_concurrent_stages: default_max_concurrent_stages(),
            event_buffer: default_event_buffer(),
            event_send_timeout_ms: default_event_send_timeout_ms(),
            light_model: None,
            fallback_backoff: BackoffConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }

    /// Applies `FORGEFLOW_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_MAX_ITERATIONS) {
            self.max_iterations = parse_env(ENV_MAX_ITERATIONS, &value)?;
        }
        if let Some(value) = lookup(ENV_CHECKPOINT_DIR) {
            self.checkpoint.dir = value.into();
        }
        if let Some(value) = lookup(ENV_STAGE_TIMEOUT_SECS) {
            self.default_stage_timeout_secs = parse_env(ENV_STAGE_TIMEOUT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_BREAKER_FAILURE_THRESHOLD) {
            self.circuit_breaker.failure_threshold =
                parse_env(ENV_BREAKER_FAILURE_THRESHOLD, &value)?;
        }
        Ok(self)
    }

    /// Sets the maximum repair passes.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the checkpoint settings.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Sets the breaker thresholds.
    #[must_use]
    pub fn with_circuit_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    /// Sets the quality thresholds.
    #[must_use]
    pub fn with_quality_thresholds(mut self, thresholds: QualityThresholds) -> Self {
        self.quality_thresholds = thresholds;
        self
    }

    /// Sets the fallback backoff.
    #[must_use]
    pub fn with_fallback_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.fallback_backoff = backoff;
        self
    }

    /// Returns the timeout for a stage.
    #[must_use]
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        Duration::from_secs(
            self.stage_timeouts
                .get(&stage)
                .copied()
                .unwrap_or(self.default_stage_timeout_secs),
        )
    }

    /// Returns how long a progress event may wait for channel capacity.
    #[must_use]
    pub fn event_send_timeout(&self) -> Duration {
        Duration::from_millis(self.event_send_timeout_ms)
    }

    /// Caps a per-run iteration request by this config and the global ceiling.
    #[must_use]
    pub fn effective_max_iterations(&self, requested: u32) -> u32 {
        requested
            .min(self.max_iterations)
            .min(GLOBAL_MAX_ITERATIONS)
    }

    /// Checks every startup invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be at least 1"));
        }
        if self.default_stage_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "default_stage_timeout_secs",
                "must be at least 1",
            ));
        }
        if let Some((stage, _)) = self.stage_timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(ConfigError::invalid(
                format!("stage_timeouts.{stage}"),
                "must be at least 1",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.circuit_breaker.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_stages == 0 {
            return Err(ConfigError::invalid("max_concurrent_stages", "must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid("event_buffer", "must be at least 1"));
        }
        self.quality_thresholds.validate()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{value}': {e}")))
}

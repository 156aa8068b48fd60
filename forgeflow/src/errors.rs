//! Error types for the forgeflow engine.
//!
//! Stage failures are data: every [`StageError`] is caught by the executor
//! and turned into a fallback value. Only [`ForgeflowError`] ever reaches a
//! caller, and only for configuration problems or faults in the engine itself.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// The main error type for forgeflow operations.
#[derive(Debug, Error)]
pub enum ForgeflowError {
    /// Invalid configuration, detected at startup.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Checkpoint persistence failed in a way the caller must see.
    #[error("{0}")]
    Checkpoint(#[from] CheckpointError),

    /// A stage error that escaped to the caller (only from direct stage use).
    #[error("{0}")]
    Stage(#[from] StageError),

    /// No checkpoint exists for the requested task.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A fault inside the graph execution engine.
    #[error("Graph execution error: {0}")]
    Graph(String),
}

/// Coarse classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// Required inputs were missing.
    Precondition,
    /// The stage exceeded its timeout.
    Timeout,
    /// The selected backend model could not be reached.
    BackendUnavailable,
    /// The stage's circuit breaker is open.
    CircuitOpen,
    /// Every model in the fallback chain failed.
    FallbackExhausted,
    /// Any other stage failure.
    Failed,
}

impl std::fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Precondition => write!(f, "precondition"),
            Self::Timeout => write!(f, "timeout"),
            Self::BackendUnavailable => write!(f, "backend_unavailable"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::FallbackExhausted => write!(f, "fallback_exhausted"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Errors produced while executing a single stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The state is missing fields the stage requires.
    #[error("Stage '{stage}' is missing required state {missing:?} (present: {present:?})")]
    PreconditionFailed {
        /// The stage that was about to run.
        stage: StageName,
        /// Required fields that were absent.
        missing: Vec<String>,
        /// Fields that were present.
        present: Vec<String>,
    },

    /// The stage did not finish within its timeout.
    #[error("Stage '{stage}' timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The stage that timed out.
        stage: StageName,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The backend model could not be reached.
    #[error("Backend model '{model}' unavailable: {message}")]
    BackendUnavailable {
        /// The model that was requested.
        model: String,
        /// Backend diagnostic.
        message: String,
    },

    /// The stage is fault-isolated.
    #[error("Circuit breaker open for stage '{stage}'")]
    CircuitOpen {
        /// The isolated stage.
        stage: String,
    },

    /// Every fallback model failed.
    #[error("Stage '{stage}' exhausted its model fallback chain (tried: {})", tried.join(", "))]
    FallbackExhausted {
        /// The stage.
        stage: StageName,
        /// Models tried, in order.
        tried: Vec<String>,
    },

    /// A generic stage failure.
    #[error("Stage '{stage}' failed: {message}")]
    Failed {
        /// The stage.
        stage: String,
        /// Failure description.
        message: String,
    },
}

impl StageError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(stage: StageName, timeout: Duration) -> Self {
        Self::Timeout { stage, timeout }
    }

    /// Creates a backend unavailable error.
    #[must_use]
    pub fn backend_unavailable(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Creates a circuit open error.
    #[must_use]
    pub fn circuit_open(stage: impl Into<String>) -> Self {
        Self::CircuitOpen {
            stage: stage.into(),
        }
    }

    /// Creates a generic failure.
    #[must_use]
    pub fn failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Returns the error classification.
    #[must_use]
    pub fn kind(&self) -> StageErrorKind {
        match self {
            Self::PreconditionFailed { .. } => StageErrorKind::Precondition,
            Self::Timeout { .. } => StageErrorKind::Timeout,
            Self::BackendUnavailable { .. } => StageErrorKind::BackendUnavailable,
            Self::CircuitOpen { .. } => StageErrorKind::CircuitOpen,
            Self::FallbackExhausted { .. } => StageErrorKind::FallbackExhausted,
            Self::Failed { .. } => StageErrorKind::Failed,
        }
    }

    /// Returns true if a later attempt (next model or next repair pass) may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            StageErrorKind::Timeout | StageErrorKind::BackendUnavailable
        )
    }

    /// Returns true if this failure should count against the stage's circuit breaker.
    #[must_use]
    pub fn trips_breaker(&self) -> bool {
        !matches!(
            self.kind(),
            StageErrorKind::Precondition | StageErrorKind::CircuitOpen
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind().to_string()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        match self {
            Self::PreconditionFailed {
                stage,
                missing,
                present,
            } => {
                map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
                map.insert("missing".to_string(), serde_json::json!(missing));
                map.insert("present".to_string(), serde_json::json!(present));
            }
            Self::Timeout { stage, timeout } => {
                map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
                map.insert(
                    "timeout_ms".to_string(),
                    serde_json::json!(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)),
                );
            }
            Self::BackendUnavailable { model, .. } => {
                map.insert("model".to_string(), serde_json::json!(model));
            }
            Self::CircuitOpen { stage } | Self::Failed { stage, .. } => {
                map.insert("stage".to_string(), serde_json::json!(stage));
            }
            Self::FallbackExhausted { stage, tried } => {
                map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
                map.insert("tried".to_string(), serde_json::json!(tried));
            }
        }

        map
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Quality thresholds must be non-decreasing simple -> medium -> complex.
    #[error(
        "Quality thresholds must satisfy simple <= medium <= complex (got {simple} / {medium} / {complex})"
    )]
    NonMonotonicThresholds {
        /// Simple threshold.
        simple: f64,
        /// Medium threshold.
        medium: f64,
        /// Complex threshold.
        complex: f64,
    },

    /// A value is outside its permitted range.
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The field name.
        field: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A pipeline stage has no handler.
    #[error("No handler registered for stage '{0}'")]
    MissingStage(StageName),

    /// The configuration file could not be read.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the task checkpointer.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem error.
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    /// State could not be serialized, even in minimal form.
    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),

    /// The task id cannot be used as a directory name.
    #[error("Invalid task id: '{0}'")]
    InvalidTaskId(String),

    /// A record on disk is unreadable.
    #[error("Corrupted checkpoint for task '{task_id}': {reason}")]
    Corrupted {
        /// The task.
        task_id: String,
        /// What was wrong.
        reason: String,
    },
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

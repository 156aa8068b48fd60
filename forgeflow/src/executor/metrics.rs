//! Per-stage duration and failure metrics.

use crate::core::StageName;
use crate::errors::StageErrorKind;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

/// One executor call, as seen by a metrics recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSample {
    /// The stage that ran.
    pub stage: StageName,
    /// Time spent in the executor.
    pub duration: Duration,
    /// Failure classification when a fallback was applied.
    pub failure: Option<StageErrorKind>,
}

/// Destination for stage samples.
///
/// Recording is best-effort: the executor logs and drops any error.
pub trait MetricsRecorder: Send + Sync + Debug {
    /// Records one sample.
    fn record(&self, sample: StageSample) -> Result<(), String>;
}

/// Aggregated counters for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageMetricsSnapshot {
    /// Executor calls.
    pub count: u64,
    /// Calls that ended in a fallback, for any reason.
    pub fallbacks: u64,
    /// Fallbacks caused by a stage error rather than a precondition or open breaker.
    pub failures: u64,
    /// Sum of call durations in milliseconds.
    pub total_ms: u64,
    /// Longest call in milliseconds.
    pub max_ms: u64,
}

impl StageMetricsSnapshot {
    /// Mean call duration in milliseconds.
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let mean = self.total_ms as f64 / self.count as f64;
            mean
        }
    }
}

/// In-memory metrics registry keyed by stage.
#[derive(Debug, Default)]
pub struct StageMetrics {
    stages: DashMap<StageName, StageMetricsSnapshot>,
}

impl StageMetrics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters for one stage.
    #[must_use]
    pub fn get(&self, stage: StageName) -> StageMetricsSnapshot {
        self.stages.get(&stage).map(|s| *s).unwrap_or_default()
    }

    /// Returns every stage's counters keyed by stage name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, StageMetricsSnapshot> {
        self.stages
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
            .collect()
    }

    /// Clears all counters.
    pub fn reset(&self) {
        self.stages.clear();
    }
}

impl MetricsRecorder for StageMetrics {
    fn record(&self, sample: StageSample) -> Result<(), String> {
        let ms = u64::try_from(sample.duration.as_millis()).unwrap_or(u64::MAX);
        let mut entry = self.stages.entry(sample.stage).or_default();
        entry.count += 1;
        entry.total_ms = entry.total_ms.saturating_add(ms);
        entry.max_ms = entry.max_ms.max(ms);
        if let Some(kind) = sample.failure {
            entry.fallbacks += 1;
            if !matches!(kind, StageErrorKind::Precondition | StageErrorKind::CircuitOpen) {
                entry.failures += 1;
            }
        }
        Ok(())
    }
}

/// A recorder that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn record(&self, _sample: StageSample) -> Result<(), String> {
        Ok(())
    }
}

//! Stage timing helper.

use crate::core::StageName;
use std::time::{Duration, Instant};
use tracing::Span;

/// Times one stage call and owns its tracing span.
#[derive(Debug)]
pub struct StageTimer {
    start: Instant,
    stage: StageName,
    span: Span,
}

impl StageTimer {
    /// Starts timing a stage for a task.
    #[must_use]
    pub fn start(stage: StageName, task_id: &str, iteration: u32) -> Self {
        let span = tracing::info_span!(
            "stage",
            stage = %stage,
            task_id = %task_id,
            iteration,
        );
        Self {
            start: Instant::now(),
            stage,
            span,
        }
    }

    /// Returns the stage being timed.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Returns the span to instrument the stage's futures with.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Returns the elapsed time.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops the timer.
    #[must_use]
    pub fn finish(self) -> Duration {
        self.elapsed()
    }
}

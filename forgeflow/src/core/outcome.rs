//! The result of one executor call.

use super::{StageName, WorkflowState};
use crate::errors::{StageError, StageErrorKind};
use std::collections::HashMap;
use std::time::Duration;

/// Outcome of running one stage through the executor.
///
/// The state is always usable: on failure it already carries the stage's
/// fallback value. Outcomes are never persisted on their own.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    /// The stage that ran.
    pub stage: StageName,
    /// The updated state.
    pub state: WorkflowState,
    /// Wall-clock time spent in the executor.
    pub elapsed: Duration,
    /// The absorbed error, if the stage failed.
    pub error: Option<StageError>,
    /// The model the stage was given, if any.
    pub model: Option<String>,
}

impl StageOutcome {
    /// Creates a successful outcome.
    #[must_use]
    pub fn success(stage: StageName, state: WorkflowState, elapsed: Duration) -> Self {
        Self {
            stage,
            state,
            elapsed,
            error: None,
            model: None,
        }
    }

    /// Creates a failed outcome whose state already holds the fallback value.
    #[must_use]
    pub fn fallback(
        stage: StageName,
        state: WorkflowState,
        elapsed: Duration,
        error: StageError,
    ) -> Self {
        Self {
            stage,
            state,
            elapsed,
            error: Some(error),
            model: None,
        }
    }

    /// Sets the model.
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the failure classification, if any.
    #[must_use]
    pub fn failure_kind(&self) -> Option<StageErrorKind> {
        self.error.as_ref().map(StageError::kind)
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }

    /// Converts to a dictionary representation for events and logs.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("stage".to_string(), serde_json::json!(self.stage.as_str()));
        map.insert(
            "status".to_string(),
            serde_json::json!(if self.is_success() { "ok" } else { "fallback" }),
        );
        map.insert("elapsed_ms".to_string(), serde_json::json!(self.elapsed_ms()));
        map.insert(
            "iteration".to_string(),
            serde_json::json!(self.state.iteration()),
        );

        if let Some(model) = &self.model {
            map.insert("model".to_string(), serde_json::json!(model));
        }
        if let Some(error) = &self.error {
            map.insert("error".to_string(), serde_json::json!(error.to_dict()));
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_outcome() {
        let outcome = StageOutcome::success(
            StageName::Plan,
            WorkflowState::new("task"),
            Duration::from_millis(12),
        )
        .with_model(Some("coder-7b".to_string()));

        assert!(outcome.is_success());
        assert_eq!(outcome.failure_kind(), None);

        let dict = outcome.to_dict();
        assert_eq!(dict.get("status").unwrap(), "ok");
        assert_eq!(dict.get("elapsed_ms").unwrap(), 12);
        assert_eq!(dict.get("model").unwrap(), "coder-7b");
    }

    #[test]
    fn test_fallback_outcome() {
        let outcome = StageOutcome::fallback(
            StageName::Validate,
            WorkflowState::new("task"),
            Duration::ZERO,
            StageError::circuit_open("validate"),
        );

        assert!(!outcome.is_success());
        assert_eq!(outcome.failure_kind(), Some(StageErrorKind::CircuitOpen));
        assert_eq!(outcome.to_dict().get("status").unwrap(), "fallback");
    }
}

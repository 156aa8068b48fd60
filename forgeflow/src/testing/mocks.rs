//! Mock stages and validators.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{StagePatch, ValidatorResult, WorkflowState};
use crate::errors::StageError;
use crate::stages::{Stage, Validator};

/// Shared, ordered log of executed stage names.
pub type StageLog = Arc<Mutex<Vec<String>>>;

/// Creates an empty stage log.
#[must_use]
pub fn stage_log() -> StageLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A stage that replays a queue of results, then a default.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    script: Mutex<VecDeque<Result<StagePatch, StageError>>>,
    otherwise: Result<StagePatch, StageError>,
    calls: AtomicUsize,
}

impl ScriptedStage {
    /// Creates a stage that leaves the state untouched once its script runs out.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            otherwise: Ok(StagePatch::Unchanged),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a stage that always applies `patch`.
    #[must_use]
    pub fn always(name: impl Into<String>, patch: StagePatch) -> Self {
        Self::new(name).otherwise(patch)
    }

    /// Queues a successful patch.
    #[must_use]
    pub fn then(self, patch: StagePatch) -> Self {
        self.script.lock().push_back(Ok(patch));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_fail(self, error: StageError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Sets the result used after the script runs out.
    #[must_use]
    pub fn otherwise(mut self, patch: StagePatch) -> Self {
        self.otherwise = Ok(patch);
        self
    }

    /// Makes the stage fail after the script runs out.
    #[must_use]
    pub fn otherwise_fail(mut self, error: StageError) -> Self {
        self.otherwise = Err(error);
        self
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.otherwise.clone());
        state.apply_patch(next?);
        Ok(state)
    }
}

/// A stage that always fails with the same error.
#[derive(Debug)]
pub struct FailingStage {
    name: String,
    error: StageError,
    calls: AtomicUsize,
}

impl FailingStage {
    /// Creates a stage failing with a generic error.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let error = StageError::failed(name.clone(), "intentional failure");
        Self::with_error(name, error)
    }

    /// Creates a stage failing with a specific error.
    #[must_use]
    pub fn with_error(name: impl Into<String>, error: StageError) -> Self {
        Self {
            name: name.into(),
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _state: WorkflowState) -> Result<WorkflowState, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// A stage that sleeps before applying a patch.
#[derive(Debug)]
pub struct SlowStage {
    name: String,
    delay: Duration,
    patch: StagePatch,
}

impl SlowStage {
    /// Creates a slow stage that leaves the state untouched.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
            patch: StagePatch::Unchanged,
        }
    }

    /// Sets the patch applied after the delay.
    #[must_use]
    pub fn with_patch(mut self, patch: StagePatch) -> Self {
        self.patch = patch;
        self
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        tokio::time::sleep(self.delay).await;
        state.apply_patch(self.patch.clone());
        Ok(state)
    }
}

/// Wraps a stage and records each call in a shared log.
#[derive(Debug)]
pub struct RecordingStage {
    label: String,
    inner: Arc<dyn Stage>,
    log: StageLog,
}

impl RecordingStage {
    /// Wraps `inner`, logging `label` on every call.
    #[must_use]
    pub fn new(label: impl Into<String>, inner: Arc<dyn Stage>, log: StageLog) -> Self {
        Self {
            label: label.into(),
            inner,
            log,
        }
    }
}

#[async_trait]
impl Stage for RecordingStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, state: WorkflowState) -> Result<WorkflowState, StageError> {
        self.log.lock().push(self.label.clone());
        self.inner.execute(state).await
    }
}

/// A validator with a fixed verdict.
#[derive(Debug, Clone)]
pub struct StaticValidator {
    name: String,
    success: bool,
    diagnostic: String,
}

impl StaticValidator {
    /// A validator that always passes.
    #[must_use]
    pub fn passing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            diagnostic: String::new(),
        }
    }

    /// A validator that always fails with a diagnostic.
    #[must_use]
    pub fn failing(name: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            diagnostic: diagnostic.into(),
        }
    }
}

#[async_trait]
impl Validator for StaticValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _code: &str, _tests: Option<&str>) -> Result<ValidatorResult, StageError> {
        Ok(ValidatorResult {
            name: self.name.clone(),
            success: self.success,
            diagnostic: self.diagnostic.clone(),
        })
    }
}

/// A validator that returns verdicts in order, repeating the last one.
#[derive(Debug)]
pub struct SequenceValidator {
    name: String,
    verdicts: Vec<bool>,
    calls: AtomicUsize,
}

impl SequenceValidator {
    /// Creates a validator from a verdict sequence. An empty sequence fails.
    #[must_use]
    pub fn new(name: impl Into<String>, verdicts: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            verdicts,
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of checks run.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for SequenceValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _code: &str, _tests: Option<&str>) -> Result<ValidatorResult, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let success = self
            .verdicts
            .get(call)
            .or_else(|| self.verdicts.last())
            .copied()
            .unwrap_or(false);
        Ok(ValidatorResult {
            name: self.name.clone(),
            success,
            diagnostic: if success {
                String::new()
            } else {
                format!("check {} failed", call + 1)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stage_replays_then_defaults() {
        let stage = ScriptedStage::new("code")
            .then(StagePatch::Code("first".to_string()))
            .then_fail(StageError::failed("code", "flaky"))
            .otherwise(StagePatch::Code("steady".to_string()));

        let state = stage.execute(WorkflowState::new("t")).await.unwrap();
        assert_eq!(state.code.as_deref(), Some("first"));
        assert!(stage.execute(state.clone()).await.is_err());
        let state = stage.execute(state).await.unwrap();
        assert_eq!(state.code.as_deref(), Some("steady"));
        assert_eq!(stage.call_count(), 3);
    }

    #[tokio::test]
    async fn test_recording_stage_logs_label() {
        let log = stage_log();
        let stage = RecordingStage::new(
            "plan",
            Arc::new(ScriptedStage::new("inner")),
            Arc::clone(&log),
        );
        let _ = stage.execute(WorkflowState::new("t")).await;
        let _ = stage.execute(WorkflowState::new("t")).await;
        assert_eq!(*log.lock(), vec!["plan".to_string(), "plan".to_string()]);
        assert_eq!(stage.name(), "inner");
    }

    #[tokio::test]
    async fn test_sequence_validator_repeats_last() {
        let validator = SequenceValidator::new("unit", vec![false, true]);
        assert!(!validator.check("", None).await.unwrap().success);
        assert!(validator.check("", None).await.unwrap().success);
        assert!(validator.check("", None).await.unwrap().success);
        assert_eq!(validator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failing_stage_counts_calls() {
        let stage = FailingStage::new("plan");
        assert!(stage.execute(WorkflowState::new("t")).await.is_err());
        assert_eq!(stage.call_count(), 1);
    }
}

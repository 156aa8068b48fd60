//! Black-box validators and the stage that aggregates them.

use super::{run_bounded, Stage};
use crate::core::{ValidationReport, ValidatorResult, WorkflowState};
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// An external checker run over generated code.
///
/// Implementations wrap linters, compilers or test runners. A returned error
/// is recorded as a failed check, never as a stage failure.
#[async_trait]
pub trait Validator: Send + Sync + Debug {
    /// Returns the validator's name.
    fn name(&self) -> &str;

    /// Checks the code, optionally against the generated tests.
    async fn check(&self, code: &str, tests: Option<&str>) -> Result<ValidatorResult, StageError>;
}

/// A `validate` stage that runs every registered validator.
///
/// Validators run concurrently up to `parallelism`; the report keeps them in
/// registration order.
#[derive(Debug, Clone)]
pub struct ValidatorSuite {
    validators: Vec<Arc<dyn Validator>>,
    parallelism: usize,
}

impl Default for ValidatorSuite {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidatorSuite {
    /// Creates an empty suite.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validators: Vec::new(),
            parallelism: 4,
        }
    }

    /// Adds a validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Sets how many validators may run at once.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Returns the number of registered validators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if no validators are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Runs every validator and aggregates the verdicts.
    pub async fn run(&self, code: &str, tests: Option<&str>) -> ValidationReport {
        if self.validators.is_empty() {
            tracing::warn!("Validator suite is empty; reporting failure");
        }

        // Each check owns its inputs so the futures borrow nothing from the caller.
        let code: Arc<str> = Arc::from(code);
        let tests: Option<Arc<str>> = tests.map(Arc::from);
        let validators = self.validators.clone();
        let results = run_bounded(0..validators.len(), self.parallelism, move |index| {
            let validator = Arc::clone(&validators[index]);
            let code = Arc::clone(&code);
            let tests = tests.clone();
            async move { check_one(validator.as_ref(), &code, tests.as_deref()).await }
        })
        .await;

        ValidationReport::from_results(results)
    }
}

async fn check_one(
    validator: &dyn Validator,
    code: &str,
    tests: Option<&str>,
) -> ValidatorResult {
    match validator.check(code, tests).await {
        Ok(mut result) => {
            if result.name.is_empty() {
                result.name = validator.name().to_string();
            }
            result
        }
        Err(e) => {
            tracing::warn!(validator = validator.name(), error = %e, "Validator errored");
            ValidatorResult {
                name: validator.name().to_string(),
                success: false,
                diagnostic: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl Stage for ValidatorSuite {
    fn name(&self) -> &str {
        "validator_suite"
    }

    async fn execute(&self, mut state: WorkflowState) -> Result<WorkflowState, StageError> {
        let Some(code) = state.code.as_deref() else {
            return Err(StageError::failed("validate", "no code to validate"));
        };

        let report = self.run(code, state.tests.as_deref()).await;
        tracing::debug!(
            task_id = %state.task_id(),
            all_passed = report.all_passed,
            checks = report.results.len(),
            "Validation finished"
        );
        state.validation = Some(report);
        Ok(state)
    }
}

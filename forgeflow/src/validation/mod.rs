//! Stage precondition checks.
//!
//! Each stage declares the state fields it needs. [`NodeValidator`] rejects a
//! stage call up front when any of them is absent, so the stage never starts
//! on a state it cannot use.

use crate::core::{StageName, StateField, WorkflowState};
use crate::errors::StageError;
use std::collections::{BTreeSet, HashMap};

/// Maps each stage to the state fields it requires.
#[derive(Debug, Clone)]
pub struct NodeValidator {
    requirements: HashMap<StageName, BTreeSet<StateField>>,
}

impl Default for NodeValidator {
    fn default() -> Self {
        Self::standard()
    }
}

impl NodeValidator {
    /// Creates a validator with no requirements.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            requirements: HashMap::new(),
        }
    }

    /// Creates the validator for the standard task-to-code pipeline.
    #[must_use]
    pub fn standard() -> Self {
        use StateField as F;

        Self::empty()
            .with_requirement(StageName::Intent, &[F::Task])
            .with_requirement(StageName::Plan, &[F::Task, F::IntentResult])
            .with_requirement(StageName::Research, &[F::Task, F::Plan])
            .with_requirement(StageName::GenerateTests, &[F::Plan])
            .with_requirement(StageName::GenerateCode, &[F::Plan])
            .with_requirement(StageName::Validate, &[F::Code])
            .with_requirement(StageName::Diagnose, &[F::Validation, F::Code])
            .with_requirement(StageName::Repair, &[F::DiagnoseResult, F::Code])
            .with_requirement(StageName::Reflect, &[F::IntentResult, F::Code])
            .with_requirement(StageName::Critique, &[F::Code])
    }

    /// Replaces a stage's requirements.
    #[must_use]
    pub fn with_requirement(mut self, stage: StageName, fields: &[StateField]) -> Self {
        self.requirements
            .insert(stage, fields.iter().copied().collect());
        self
    }

    /// Returns the fields a stage requires.
    #[must_use]
    pub fn requirements(&self, stage: StageName) -> Vec<StateField> {
        self.requirements
            .get(&stage)
            .map(|fields| fields.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Returns the required fields absent from the state.
    #[must_use]
    pub fn missing(&self, stage: StageName, state: &WorkflowState) -> Vec<StateField> {
        self.requirements
            .get(&stage)
            .map(|fields| fields.iter().copied().filter(|f| !state.has(*f)).collect())
            .unwrap_or_default()
    }

    /// Checks that the state satisfies the stage's preconditions.
    pub fn validate(&self, stage: StageName, state: &WorkflowState) -> Result<(), StageError> {
        let missing = self.missing(stage, state);
        if missing.is_empty() {
            return Ok(());
        }

        let to_names = |fields: Vec<StateField>| {
            fields
                .into_iter()
                .map(|f| f.as_str().to_string())
                .collect::<Vec<_>>()
        };

        Err(StageError::PreconditionFailed {
            stage,
            missing: to_names(missing),
            present: to_names(state.present_fields()),
        })
    }
}

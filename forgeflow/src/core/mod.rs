//! Core domain model types for forgeflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage names, task status and classification enums
//! - The typed workflow state and its domain values
//! - Stage outcomes and dynamic extension values

mod outcome;
mod state;
mod status;
mod value;

pub use outcome::StageOutcome;
pub use state::{
    CritiqueReport, Diagnosis, IntentResult, Reflection, RunConfig, StageFailure, StagePatch,
    StateField, ValidationReport, ValidatorResult, WorkflowState,
};
pub use status::{Complexity, StageName, TaskStatus, TaskType};
pub use value::{ContextValue, SharedValue};

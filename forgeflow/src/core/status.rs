//! Stage names, task status and classification enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A step of the task-to-code pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Classify the task's intent.
    Intent,
    /// Produce an implementation plan.
    Plan,
    /// Gather context for the plan.
    Research,
    /// Write tests for the planned code.
    GenerateTests,
    /// Write the code.
    GenerateCode,
    /// Run the validators.
    Validate,
    /// Explain a validation failure.
    Diagnose,
    /// Edit the code to fix the diagnosed failure.
    Repair,
    /// Score the result.
    Reflect,
    /// Review the final result.
    Critique,
}

impl StageName {
    /// Every stage, in pipeline order.
    pub const ALL: [Self; 10] = [
        Self::Intent,
        Self::Plan,
        Self::Research,
        Self::GenerateTests,
        Self::GenerateCode,
        Self::Validate,
        Self::Diagnose,
        Self::Repair,
        Self::Reflect,
        Self::Critique,
    ];

    /// Returns the snake_case name used in events, logs and checkpoints.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Intent => "intent",
            Self::Plan => "plan",
            Self::Research => "research",
            Self::GenerateTests => "generate_tests",
            Self::GenerateCode => "generate_code",
            Self::Validate => "validate",
            Self::Diagnose => "diagnose",
            Self::Repair => "repair",
            Self::Reflect => "reflect",
            Self::Critique => "critique",
        }
    }

    /// Returns the kind of backend work this stage requests.
    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        match self {
            Self::Intent => TaskType::Classification,
            Self::GenerateTests | Self::GenerateCode | Self::Repair => TaskType::Coding,
            Self::Plan
            | Self::Research
            | Self::Validate
            | Self::Diagnose
            | Self::Reflect
            | Self::Critique => TaskType::Reasoning,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|stage| stage.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown stage name: {s}"))
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Stages are still being executed.
    #[default]
    Running,
    /// Halted between stages; can be resumed.
    Paused,
    /// Reached a terminal stage.
    Completed,
    /// Ended by an unrecoverable engine fault.
    Failed,
}

impl TaskStatus {
    /// Returns true for completed or failed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true for running or paused.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Coarse size class of a task, used to size model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Small, self-contained edits.
    Simple,
    /// Typical tasks.
    #[default]
    Medium,
    /// Multi-part or design-heavy tasks.
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple => write!(f, "simple"),
            Self::Medium => write!(f, "medium"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// The kind of work a stage asks a backend model to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Writing or editing code.
    Coding,
    /// Lightweight labelling.
    Classification,
    /// Planning, diagnosis and review.
    Reasoning,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coding => write!(f, "coding"),
            Self::Classification => write!(f, "classification"),
            Self::Reasoning => write!(f, "reasoning"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_display() {
        assert_eq!(StageName::GenerateTests.to_string(), "generate_tests");
        assert_eq!(StageName::Critique.to_string(), "critique");
    }

    #[test]
    fn test_stage_name_from_str() {
        assert_eq!("repair".parse::<StageName>(), Ok(StageName::Repair));
        assert!("deploy".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_name_serialize() {
        let json = serde_json::to_string(&StageName::GenerateCode).unwrap();
        assert_eq!(json, r#""generate_code""#);

        let parsed: StageName = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, StageName::GenerateCode);
    }

    #[test]
    fn test_task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Paused.is_active());
        assert!(TaskStatus::Running.is_active());
    }

    #[test]
    fn test_stage_task_types() {
        assert_eq!(StageName::Intent.task_type(), TaskType::Classification);
        assert_eq!(StageName::Repair.task_type(), TaskType::Coding);
        assert_eq!(StageName::Critique.task_type(), TaskType::Reasoning);
    }
}

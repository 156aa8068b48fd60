//! Progress events reported to an observer.

use crate::core::{StageName, TaskStatus, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Phase reported by a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// A stage is starting.
    Start,
    /// Intermediate progress within a stage.
    Progress,
    /// A stage finished (possibly with a fallback).
    End,
    /// A stage failed, or the task ended with a hard failure.
    Error,
    /// The task finished; carries the aggregated results.
    Complete,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Progress => write!(f, "progress"),
            Self::End => write!(f, "end"),
            Self::Error => write!(f, "error"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One event in a task's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The task.
    pub task_id: String,
    /// The stage, absent for task-level events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// Phase.
    pub status: EventStatus,
    /// Human-readable message.
    pub message: String,
    /// Optional result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Metric scores, on the terminal event.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn new(task_id: &str, stage: Option<StageName>, status: EventStatus, message: String) -> Self {
        Self {
            task_id: task_id.to_string(),
            stage,
            status,
            message,
            result: None,
            scores: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A stage is starting.
    #[must_use]
    pub fn start(task_id: &str, stage: StageName) -> Self {
        Self::new(task_id, Some(stage), EventStatus::Start, format!("{stage} started"))
    }

    /// Intermediate progress.
    #[must_use]
    pub fn progress(task_id: &str, stage: StageName, message: impl Into<String>) -> Self {
        Self::new(task_id, Some(stage), EventStatus::Progress, message.into())
    }

    /// A stage finished.
    #[must_use]
    pub fn end(task_id: &str, stage: StageName, result: serde_json::Value) -> Self {
        Self::new(task_id, Some(stage), EventStatus::End, format!("{stage} finished"))
            .with_result(result)
    }

    /// A stage failed and its fallback was applied.
    #[must_use]
    pub fn stage_error(task_id: &str, stage: StageName, message: impl Into<String>) -> Self {
        Self::new(task_id, Some(stage), EventStatus::Error, message.into())
    }

    /// Terminal event for a task that reached an end state.
    #[must_use]
    pub fn complete(state: &WorkflowState, status: TaskStatus) -> Self {
        let mut event = Self::new(
            state.task_id(),
            None,
            EventStatus::Complete,
            format!("task {status}"),
        )
        .with_result(state.results());
        event.scores = state.scores();
        event
    }

    /// Terminal event for a hard task failure.
    #[must_use]
    pub fn failed(task_id: &str, message: impl Into<String>) -> Self {
        Self::new(task_id, None, EventStatus::Error, message.into())
    }

    /// Attaches a result payload.
    #[must_use]
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Returns true for the events that end a task's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.stage.is_none() && matches!(self.status, EventStatus::Complete | EventStatus::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_events() {
        let start = ProgressEvent::start("t1", StageName::Plan);
        assert_eq!(start.status, EventStatus::Start);
        assert_eq!(start.message, "plan started");
        assert!(!start.is_terminal());

        let err = ProgressEvent::stage_error("t1", StageName::Plan, "timeout");
        assert!(!err.is_terminal());
    }

    #[test]
    fn test_complete_event_carries_results_and_scores() {
        let mut state = WorkflowState::new("add");
        state.code = Some("fn add() {}".to_string());
        state.critique = Some(crate::core::CritiqueReport {
            score: 0.75,
            ..Default::default()
        });

        let event = ProgressEvent::complete(&state, TaskStatus::Completed);
        assert!(event.is_terminal());
        assert_eq!(event.result.as_ref().unwrap()["code"], "fn add() {}");
        assert_eq!(event.scores.get("critique"), Some(&0.75));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["status"], "complete");
        assert!(json.get("stage").is_none());
    }
}

//! The result of running or resuming a task.

use crate::core::{StageName, TaskStatus, WorkflowState};
use serde_json::json;

/// Final state of one task run.
#[derive(Debug, Clone)]
pub struct TaskRun {
    /// Task id.
    pub task_id: String,
    /// Completed or paused.
    pub status: TaskStatus,
    /// The state after the last stage.
    pub state: WorkflowState,
    /// Stages executed by this run, in order.
    pub visited: Vec<StageName>,
}

impl TaskRun {
    /// Creates a run result.
    #[must_use]
    pub fn new(state: WorkflowState, status: TaskStatus, visited: Vec<StageName>) -> Self {
        Self {
            task_id: state.task_id().to_string(),
            status,
            state,
            visited,
        }
    }

    /// Returns whether the last validation passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.state.all_passed()
    }

    /// Returns the repair iteration the task ended on.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.state.iteration()
    }

    /// Returns the canned reply of a short-circuited task.
    #[must_use]
    pub fn final_response(&self) -> Option<&str> {
        self.state.final_response.as_deref()
    }

    /// Returns how many times a stage ran.
    #[must_use]
    pub fn times_visited(&self, stage: StageName) -> usize {
        self.visited.iter().filter(|s| **s == stage).count()
    }

    /// Converts to a JSON summary.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        json!({
            "task_id": self.task_id,
            "status": self.status,
            "all_passed": self.all_passed(),
            "iteration": self.iteration(),
            "visited": self.visited,
            "failures": self.state.failures,
            "results": self.state.results(),
            "scores": self.state.scores(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary() {
        let state = WorkflowState::new("task");
        let run = TaskRun::new(
            state,
            TaskStatus::Completed,
            vec![StageName::Validate, StageName::Diagnose, StageName::Validate],
        );

        assert_eq!(run.times_visited(StageName::Validate), 2);
        assert!(!run.all_passed());

        let dict = run.to_dict();
        assert_eq!(dict["status"], "completed");
        assert_eq!(dict["visited"][1], "diagnose");
        assert_eq!(dict["task_id"], run.task_id.as_str());
    }
}

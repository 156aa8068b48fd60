//! Assertions over task runs and event streams.

use crate::core::{StageName, TaskStatus};
use crate::events::{EventStatus, ProgressEvent};
use crate::graph::TaskRun;

/// Asserts that the run completed.
pub fn assert_completed(run: &TaskRun) {
    assert_eq!(
        run.status,
        TaskStatus::Completed,
        "Expected task {} to complete, got {:?}",
        run.task_id,
        run.status
    );
}

/// Asserts the exact stage sequence of a run.
pub fn assert_visited(run: &TaskRun, expected: &[StageName]) {
    assert_eq!(
        run.visited, expected,
        "Unexpected stage sequence for task {}",
        run.task_id
    );
}

/// Asserts that a stage never ran.
pub fn assert_not_visited(run: &TaskRun, stage: StageName) {
    assert!(
        !run.visited.contains(&stage),
        "Expected stage '{stage}' not to run, visited: {:?}",
        run.visited
    );
}

/// Asserts that a task's events pair every start with an end or error, in
/// order, and finish with exactly one terminal event.
pub fn assert_event_stream(events: &[ProgressEvent], task_id: &str) {
    let events: Vec<&ProgressEvent> = events.iter().filter(|e| e.task_id == task_id).collect();
    let terminal = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminal, 1, "Expected one terminal event, got {terminal}");
    assert!(
        events.last().is_some_and(|e| e.is_terminal()),
        "Terminal event must be last"
    );

    let mut open: Option<StageName> = None;
    for event in &events {
        match (event.status, event.stage) {
            (EventStatus::Start, Some(stage)) => {
                assert!(open.is_none(), "Stage '{stage}' started while {open:?} was running");
                open = Some(stage);
            }
            (EventStatus::End | EventStatus::Error, Some(stage)) => {
                assert_eq!(open, Some(stage), "Stage '{stage}' ended without starting");
                open = None;
            }
            _ => {}
        }
    }
    assert!(open.is_none(), "Stage {open:?} never ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkflowState;

    #[test]
    fn test_event_stream_accepts_well_formed() {
        let state = WorkflowState::new("t");
        let id = state.task_id().to_string();
        let events = vec![
            ProgressEvent::start(&id, StageName::Intent),
            ProgressEvent::end(&id, StageName::Intent, serde_json::json!({})),
            ProgressEvent::complete(&state, TaskStatus::Completed),
        ];
        assert_event_stream(&events, &id);
    }

    #[test]
    #[should_panic(expected = "terminal")]
    fn test_event_stream_rejects_missing_terminal() {
        let events = vec![ProgressEvent::start("t", StageName::Intent)];
        assert_event_stream(&events, "t");
    }
}

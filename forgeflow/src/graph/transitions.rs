//! Stage order and transition rules.

use super::controller::{RepairDecision, SelfHealingController};
use crate::core::{StageName, WorkflowState};
use std::fmt;

/// Where control goes after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Run this stage next.
    Stage(StageName),
    /// The task is done.
    End,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(stage) => write!(f, "{stage}"),
            Self::End => f.write_str("END"),
        }
    }
}

/// Every possible successor of a stage, for introspection.
#[must_use]
pub fn successors(stage: StageName) -> Vec<Transition> {
    use StageName::{
        Critique, Diagnose, GenerateCode, GenerateTests, Intent, Plan, Reflect, Repair, Research,
        Validate,
    };
    match stage {
        Intent => vec![Transition::Stage(Plan), Transition::End],
        Plan => vec![Transition::Stage(Research)],
        Research => vec![Transition::Stage(GenerateTests)],
        GenerateTests => vec![Transition::Stage(GenerateCode)],
        GenerateCode => vec![Transition::Stage(Validate)],
        Validate => vec![Transition::Stage(Diagnose), Transition::Stage(Reflect)],
        Diagnose => vec![Transition::Stage(Repair)],
        Repair => vec![Transition::Stage(Validate)],
        Reflect => vec![Transition::Stage(Critique)],
        Critique => vec![Transition::End],
    }
}

/// Trivial intents short-circuit to the end.
#[must_use]
pub fn route_after_intent(state: &WorkflowState) -> Transition {
    if state.is_trivial() {
        Transition::End
    } else {
        Transition::Stage(StageName::Plan)
    }
}

/// Applies the self-healing controller at the validate exit.
#[must_use]
pub fn route_after_validate(
    state: &WorkflowState,
    controller: &SelfHealingController,
    max_iterations: u32,
) -> Transition {
    match controller.evaluate(state, max_iterations) {
        RepairDecision::Continue => Transition::Stage(StageName::Diagnose),
        RepairDecision::Finish(reason) => {
            tracing::info!(
                task_id = %state.task_id(),
                iteration = state.iteration(),
                all_passed = state.all_passed(),
                reason = %reason,
                "Repair loop finished"
            );
            Transition::Stage(StageName::Reflect)
        }
    }
}

/// Returns the transition taken after `stage` completed on `state`.
#[must_use]
pub fn next_transition(
    stage: StageName,
    state: &WorkflowState,
    controller: &SelfHealingController,
    max_iterations: u32,
) -> Transition {
    match stage {
        StageName::Intent => route_after_intent(state),
        StageName::Validate => route_after_validate(state, controller, max_iterations),
        _ => successors(stage)
            .first()
            .copied()
            .unwrap_or(Transition::End),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IntentResult, ValidationReport};
    use std::collections::HashSet;

    fn walk_linear(from: StageName) -> Vec<StageName> {
        let controller = SelfHealingController::new();
        let state = WorkflowState::new("task");
        let mut visited = vec![from];
        let mut current = from;
        while let Transition::Stage(next) = next_transition(current, &state, &controller, 3) {
            if next == StageName::Validate {
                visited.push(next);
                break;
            }
            visited.push(next);
            current = next;
        }
        visited
    }

    #[test]
    fn test_linear_prefix() {
        let mut state = WorkflowState::new("task");
        state.intent_result = Some(IntentResult::new("create"));
        assert_eq!(route_after_intent(&state), Transition::Stage(StageName::Plan));
        assert_eq!(
            walk_linear(StageName::Plan),
            vec![
                StageName::Plan,
                StageName::Research,
                StageName::GenerateTests,
                StageName::GenerateCode,
                StageName::Validate,
            ]
        );
    }

    #[test]
    fn test_trivial_intent_ends() {
        let mut state = WorkflowState::new("hi");
        state.intent_result = Some(IntentResult::trivial("greeting", None));
        assert_eq!(route_after_intent(&state), Transition::End);
    }

    #[test]
    fn test_validate_routes() {
        let controller = SelfHealingController::new();
        let mut state = WorkflowState::new("task");
        state.code = Some("x".to_string());
        state.validation = Some(ValidationReport::single("unit", false, "boom"));
        assert_eq!(
            next_transition(StageName::Validate, &state, &controller, 3),
            Transition::Stage(StageName::Diagnose)
        );

        state.validation = Some(ValidationReport::single("unit", true, ""));
        assert_eq!(
            next_transition(StageName::Validate, &state, &controller, 3),
            Transition::Stage(StageName::Reflect)
        );
    }

    #[test]
    fn test_repair_cycle_is_only_cycle() {
        let controller = SelfHealingController::new();
        let state = WorkflowState::new("task");
        assert_eq!(
            next_transition(StageName::Repair, &state, &controller, 3),
            Transition::Stage(StageName::Validate)
        );
        assert_eq!(
            next_transition(StageName::Critique, &state, &controller, 3),
            Transition::End
        );

        let back_edges: HashSet<(StageName, StageName)> = StageName::ALL
            .iter()
            .flat_map(|from| {
                successors(*from).into_iter().filter_map(move |t| match t {
                    Transition::Stage(to) if to <= *from => Some((*from, to)),
                    _ => None,
                })
            })
            .collect();
        assert_eq!(
            back_edges,
            HashSet::from([(StageName::Repair, StageName::Validate)])
        );
    }
}

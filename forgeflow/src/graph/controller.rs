//! Repair loop decision at the validate exit.

use crate::config::GLOBAL_MAX_ITERATIONS;
use crate::core::WorkflowState;
use std::fmt;

/// Why the repair loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// Every validator passed.
    Passed,
    /// A repair pass produced no code; treated as a backend failure.
    EmptyCode,
    /// The iteration cap was reached.
    IterationCap,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::EmptyCode => write!(f, "empty_code"),
            Self::IterationCap => write!(f, "iteration_cap"),
        }
    }
}

/// What to do after a validate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairDecision {
    /// Go to diagnose and run another repair pass.
    Continue,
    /// Leave the loop and go to reflect.
    Finish(FinishReason),
}

impl RepairDecision {
    /// Returns true for [`RepairDecision::Finish`].
    #[must_use]
    pub fn is_finish(&self) -> bool {
        matches!(self, Self::Finish(_))
    }
}

/// Pure decision function for the self-healing loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfHealingController;

impl SelfHealingController {
    /// Creates a controller.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Decides from raw inputs. Rules apply in order; the cap is clamped to
    /// [`GLOBAL_MAX_ITERATIONS`].
    #[must_use]
    pub fn decide(
        &self,
        all_passed: bool,
        iteration: u32,
        max_iterations: u32,
        code_is_empty: bool,
    ) -> RepairDecision {
        if all_passed {
            return RepairDecision::Finish(FinishReason::Passed);
        }
        if code_is_empty && iteration > 0 {
            return RepairDecision::Finish(FinishReason::EmptyCode);
        }
        if iteration >= max_iterations.min(GLOBAL_MAX_ITERATIONS) {
            return RepairDecision::Finish(FinishReason::IterationCap);
        }
        RepairDecision::Continue
    }

    /// Decides for a state.
    #[must_use]
    pub fn evaluate(&self, state: &WorkflowState, max_iterations: u32) -> RepairDecision {
        self.decide(
            state.all_passed(),
            state.iteration(),
            max_iterations,
            state.code_is_empty(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_always_finishes() {
        let controller = SelfHealingController::new();
        for iteration in 0..=12 {
            assert_eq!(
                controller.decide(true, iteration, 3, false),
                RepairDecision::Finish(FinishReason::Passed)
            );
        }
    }

    #[test]
    fn test_empty_code_after_first_pass_finishes() {
        let controller = SelfHealingController::new();
        assert_eq!(controller.decide(false, 0, 3, true), RepairDecision::Continue);
        assert_eq!(
            controller.decide(false, 1, 3, true),
            RepairDecision::Finish(FinishReason::EmptyCode)
        );
    }

    #[test]
    fn test_cap() {
        let controller = SelfHealingController::new();
        assert_eq!(controller.decide(false, 2, 3, false), RepairDecision::Continue);
        assert_eq!(
            controller.decide(false, 3, 3, false),
            RepairDecision::Finish(FinishReason::IterationCap)
        );
        assert!(controller.decide(false, 0, 0, false).is_finish());
    }

    #[test]
    fn test_global_ceiling() {
        let controller = SelfHealingController::new();
        assert_eq!(controller.decide(false, 9, 50, false), RepairDecision::Continue);
        assert_eq!(
            controller.decide(false, GLOBAL_MAX_ITERATIONS, 50, false),
            RepairDecision::Finish(FinishReason::IterationCap)
        );
    }

    #[test]
    fn test_evaluate_reads_state() {
        let mut state = WorkflowState::new("task");
        state.code = Some("fn f() {}".to_string());
        assert_eq!(
            SelfHealingController::new().evaluate(&state, 3),
            RepairDecision::Continue
        );
    }
}

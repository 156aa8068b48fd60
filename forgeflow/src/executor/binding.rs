//! A stage registered with the executor, plus its fallback value.

use crate::core::{
    CritiqueReport, Diagnosis, IntentResult, Reflection, StageName, StagePatch, ValidationReport,
};
use crate::stages::Stage;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Zero-argument producer of a fallback value.
pub type FallbackProducer = Arc<dyn Fn() -> StagePatch + Send + Sync>;

/// The value applied to the state when a stage fails.
#[derive(Clone)]
pub enum Fallback {
    /// A fixed value.
    Constant(StagePatch),
    /// A value computed on each failure.
    Producer(FallbackProducer),
}

impl Fallback {
    /// Creates a producer fallback.
    pub fn producer<F>(f: F) -> Self
    where
        F: Fn() -> StagePatch + Send + Sync + 'static,
    {
        Self::Producer(Arc::new(f))
    }

    /// Returns the built-in fallback for a stage.
    ///
    /// Code-producing stages keep whatever code the state already holds, so a
    /// failed repair leaves the previous attempt in place.
    #[must_use]
    pub fn default_for(stage: StageName) -> Self {
        match stage {
            StageName::Intent => Self::producer(|| {
                StagePatch::Intent(IntentResult {
                    intent: "create".to_string(),
                    trivial: false,
                    confidence: 0.0,
                    reply: None,
                })
            }),
            StageName::Plan => Self::producer(|| {
                StagePatch::Plan("Implement the task directly; no plan was produced.".to_string())
            }),
            StageName::Validate => Self::producer(|| {
                StagePatch::Validation(ValidationReport::default())
            }),
            StageName::Diagnose => Self::producer(|| {
                StagePatch::Diagnosis(Diagnosis {
                    summary: "unavailable".to_string(),
                    ..Diagnosis::default()
                })
            }),
            StageName::Reflect => Self::producer(|| StagePatch::Reflection(Reflection::default())),
            StageName::Critique => {
                Self::producer(|| StagePatch::Critique(CritiqueReport::default()))
            }
            StageName::Research
            | StageName::GenerateTests
            | StageName::GenerateCode
            | StageName::Repair => Self::Constant(StagePatch::Unchanged),
        }
    }

    /// Produces the patch to apply.
    #[must_use]
    pub fn value(&self) -> StagePatch {
        match self {
            Self::Constant(patch) => patch.clone(),
            Self::Producer(f) => f(),
        }
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(patch) => f.debug_tuple("Constant").field(patch).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// A stage implementation bound to a pipeline step.
#[derive(Debug, Clone)]
pub struct StageBinding {
    /// The step this binding runs.
    pub name: StageName,
    /// The implementation.
    pub stage: Arc<dyn Stage>,
    /// Applied when the stage fails.
    pub fallback: Fallback,
    /// Upper bound on one call.
    pub timeout: Duration,
}

impl StageBinding {
    /// Binds a stage with its default fallback and the given timeout.
    #[must_use]
    pub fn new(name: StageName, stage: Arc<dyn Stage>, timeout: Duration) -> Self {
        Self {
            name,
            stage,
            fallback: Fallback::default_for(name),
            timeout,
        }
    }

    /// Replaces the fallback.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Replaces the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkflowState;
    use crate::stages::NoOpStage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_default_fallbacks() {
        let mut state = WorkflowState::new("task");
        state.code = Some("fn old() {}".to_string());

        for stage in StageName::ALL {
            state.apply_patch(Fallback::default_for(stage).value());
        }

        assert_eq!(state.code.as_deref(), Some("fn old() {}"));
        assert!(!state.all_passed());
        assert!(!state.is_trivial());
        assert_eq!(state.diagnose_result.unwrap().summary, "unavailable");
        assert!(state.plan.is_some());
    }

    #[test]
    fn test_producer_runs_each_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fallback = Fallback::producer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            StagePatch::Code(String::new())
        });

        let _ = fallback.value();
        let _ = fallback.value();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(format!("{fallback:?}"), "Producer(..)");
    }

    #[test]
    fn test_binding_builders() {
        let binding = StageBinding::new(
            StageName::Plan,
            Arc::new(NoOpStage::new("plan")),
            Duration::from_secs(5),
        )
        .with_timeout(Duration::from_millis(50))
        .with_fallback(Fallback::Constant(StagePatch::Plan("p".to_string())));

        assert_eq!(binding.timeout, Duration::from_millis(50));
        assert_eq!(binding.fallback.value(), StagePatch::Plan("p".to_string()));
    }
}

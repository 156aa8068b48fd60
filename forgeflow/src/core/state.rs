//! The workflow state threaded through every stage.
//!
//! [`WorkflowState`] is a typed record with one optional field per domain
//! value. A field that is `None` (or holds only whitespace) is "absent" for
//! precondition purposes. The task id and the repair iteration counter are
//! owned by the engine: stages can read them but only the engine can change
//! them, which keeps the id immutable and the counter monotonic.

use super::{Complexity, ContextValue, StageName};
use crate::errors::StageErrorKind;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

// Non-finite floats are written by serde_json as null; read them back as NaN.
fn lenient_float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

fn lenient_scores<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    let scores = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
    Ok(scores
        .into_iter()
        .map(|(name, score)| (name, score.unwrap_or(f64::NAN)))
        .collect())
}

/// Per-run configuration carried inside the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Maximum number of repair passes for this task.
    pub max_iterations: u32,
    /// Model requested by the caller, if any.
    pub model_override: Option<String>,
    /// Sampling temperature forwarded to stages.
    #[serde(deserialize_with = "lenient_float")]
    pub temperature: f64,
    /// Free-form feature flags.
    pub features: BTreeMap<String, bool>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            model_override: None,
            temperature: 0.2,
            features: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Returns whether a feature flag is enabled.
    #[must_use]
    pub fn feature(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }
}

/// Result of intent classification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentResult {
    /// Classified intent label (e.g. "create", "fix", "greeting").
    pub intent: String,
    /// Whether the task can be answered without running the pipeline.
    pub trivial: bool,
    /// Classifier confidence in [0, 1].
    #[serde(deserialize_with = "lenient_float")]
    pub confidence: f64,
    /// Direct reply for trivial intents.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

impl IntentResult {
    /// Creates a non-trivial intent.
    #[must_use]
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            trivial: false,
            confidence: 1.0,
            reply: None,
        }
    }

    /// Creates a trivial intent, optionally with a reply.
    #[must_use]
    pub fn trivial(intent: impl Into<String>, reply: Option<String>) -> Self {
        Self {
            intent: intent.into(),
            trivial: true,
            confidence: 1.0,
            reply,
        }
    }
}

/// One validator's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorResult {
    /// Validator name.
    pub name: String,
    /// Whether the check passed.
    pub success: bool,
    /// Diagnostic output.
    pub diagnostic: String,
}

/// Aggregated validation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationReport {
    /// True only if every validator passed.
    pub all_passed: bool,
    /// Per-validator results.
    pub results: Vec<ValidatorResult>,
}

impl ValidationReport {
    /// Builds a report from individual results. An empty result set does not pass.
    #[must_use]
    pub fn from_results(results: Vec<ValidatorResult>) -> Self {
        let all_passed = !results.is_empty() && results.iter().all(|r| r.success);
        Self {
            all_passed,
            results,
        }
    }

    /// Creates a single-result report.
    #[must_use]
    pub fn single(name: impl Into<String>, success: bool, diagnostic: impl Into<String>) -> Self {
        Self::from_results(vec![ValidatorResult {
            name: name.into(),
            success,
            diagnostic: diagnostic.into(),
        }])
    }

    /// Concatenated diagnostics of the failing validators.
    #[must_use]
    pub fn failure_diagnostics(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| format!("[{}] {}", r.name, r.diagnostic))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Explanation of a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnosis {
    /// Short summary.
    pub summary: String,
    /// Suspected root cause.
    pub root_cause: String,
    /// Suggested fix.
    pub suggested_fix: String,
}

/// Self-assessment scores.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Reflection {
    /// Named scores in [0, 1].
    #[serde(deserialize_with = "lenient_scores")]
    pub scores: BTreeMap<String, f64>,
    /// Free-text summary.
    pub summary: String,
}

/// Final review of the result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CritiqueReport {
    /// Overall score in [0, 1].
    #[serde(deserialize_with = "lenient_float")]
    pub score: f64,
    /// Issues found.
    pub issues: Vec<String>,
    /// Free-text summary.
    pub summary: String,
}

/// A stage failure that was absorbed by a fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The stage that failed.
    pub stage: StageName,
    /// Failure classification.
    pub kind: StageErrorKind,
    /// Error message.
    pub message: String,
    /// Repair iteration at the time of failure.
    pub iteration: u32,
}

/// A named domain field of [`WorkflowState`], used for precondition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateField {
    /// The task text.
    Task,
    /// Intent classification.
    IntentResult,
    /// Implementation plan.
    Plan,
    /// Gathered context.
    Context,
    /// Generated tests.
    Tests,
    /// Generated code.
    Code,
    /// Validation report.
    Validation,
    /// Failure diagnosis.
    DiagnoseResult,
    /// Reflection scores.
    Reflection,
    /// Critique report.
    Critique,
}

impl StateField {
    /// Every field, in declaration order.
    pub const ALL: [Self; 10] = [
        Self::Task,
        Self::IntentResult,
        Self::Plan,
        Self::Context,
        Self::Tests,
        Self::Code,
        Self::Validation,
        Self::DiagnoseResult,
        Self::Reflection,
        Self::Critique,
    ];

    /// Returns the field's key name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::IntentResult => "intent_result",
            Self::Plan => "plan",
            Self::Context => "context",
            Self::Tests => "tests",
            Self::Code => "code",
            Self::Validation => "validation",
            Self::DiagnoseResult => "diagnose_result",
            Self::Reflection => "reflection",
            Self::Critique => "critique",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-field update applied to the state, used for fallback values.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StagePatch {
    /// Leave the state as it is.
    #[default]
    Unchanged,
    /// Set the intent classification.
    Intent(IntentResult),
    /// Set the plan.
    Plan(String),
    /// Set the gathered context.
    Context(String),
    /// Set the tests.
    Tests(String),
    /// Set the code.
    Code(String),
    /// Set the validation report.
    Validation(ValidationReport),
    /// Set the diagnosis.
    Diagnosis(Diagnosis),
    /// Set the reflection.
    Reflection(Reflection),
    /// Set the critique.
    Critique(CritiqueReport),
}

/// The record threaded through every stage of one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowState {
    task_id: String,
    iteration: u32,

    /// The natural-language task.
    pub task: String,
    /// Per-run configuration.
    pub config: RunConfig,
    /// Size class used for model selection.
    pub complexity: Complexity,

    /// Intent classification.
    pub intent_result: Option<IntentResult>,
    /// Implementation plan.
    pub plan: Option<String>,
    /// Gathered context.
    pub context: Option<String>,
    /// Generated tests.
    pub tests: Option<String>,
    /// Generated code.
    pub code: Option<String>,
    /// Latest validation report.
    pub validation: Option<ValidationReport>,
    /// Latest diagnosis.
    pub diagnose_result: Option<Diagnosis>,
    /// Reflection scores.
    pub reflection: Option<Reflection>,
    /// Critique report.
    pub critique: Option<CritiqueReport>,
    /// Reply for short-circuited tasks.
    pub final_response: Option<String>,

    /// Model used by the most recent stage.
    pub model: Option<String>,
    /// Set when the selected model was under-qualified.
    pub model_warning: Option<String>,
    /// Whether progress events are emitted for this task.
    pub stream: bool,
    /// Failures absorbed by fallbacks, in order.
    pub failures: Vec<StageFailure>,

    /// Stage-defined extension values. Persisted by the checkpointer's
    /// cycle-safe encoder rather than by serde.
    #[serde(skip)]
    pub extras: BTreeMap<String, ContextValue>,
}

impl WorkflowState {
    /// Creates a state for a new task with a fresh id.
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().simple().to_string(),
            task: task.into(),
            ..Self::default()
        }
    }

    /// Sets the task id. Only meaningful before the task starts.
    #[must_use]
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    /// Sets the run configuration.
    #[must_use]
    pub fn with_config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the maximum number of repair passes.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Sets the complexity class.
    #[must_use]
    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// Sets the preferred model.
    #[must_use]
    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.config.model_override = Some(model.into());
        self
    }

    /// Enables or disables progress events.
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Returns the task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns the number of repair passes started so far.
    #[must_use]
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Starts another repair pass.
    pub(crate) fn begin_repair_pass(&mut self) {
        self.iteration = self.iteration.saturating_add(1);
    }

    /// Restores engine-owned fields after a stage returned a replacement state.
    pub(crate) fn reassert_identity(&mut self, task_id: &str, iteration: u32) {
        if self.task_id != task_id {
            tracing::warn!(
                task_id = %task_id,
                attempted = %self.task_id,
                "Stage attempted to change task_id; restoring"
            );
            self.task_id = task_id.to_string();
        }
        self.iteration = iteration;
    }

    /// Ensures a task id exists, generating one if the state was built by hand.
    pub(crate) fn ensure_task_id(&mut self) {
        if self.task_id.trim().is_empty() {
            self.task_id = Uuid::new_v4().simple().to_string();
        }
    }

    /// Returns whether the latest validation fully passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.validation.as_ref().is_some_and(|v| v.all_passed)
    }

    /// Returns whether the classified intent short-circuits the pipeline.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.intent_result.as_ref().is_some_and(|i| i.trivial)
    }

    /// Returns whether the code is absent or blank.
    #[must_use]
    pub fn code_is_empty(&self) -> bool {
        !self.has(StateField::Code)
    }

    /// Returns whether a domain field is present (non-null and non-blank).
    #[must_use]
    pub fn has(&self, field: StateField) -> bool {
        fn non_blank(value: Option<&String>) -> bool {
            value.is_some_and(|v| !v.trim().is_empty())
        }

        match field {
            StateField::Task => !self.task.trim().is_empty(),
            StateField::IntentResult => self.intent_result.is_some(),
            StateField::Plan => non_blank(self.plan.as_ref()),
            StateField::Context => non_blank(self.context.as_ref()),
            StateField::Tests => non_blank(self.tests.as_ref()),
            StateField::Code => non_blank(self.code.as_ref()),
            StateField::Validation => self.validation.is_some(),
            StateField::DiagnoseResult => self.diagnose_result.is_some(),
            StateField::Reflection => self.reflection.is_some(),
            StateField::Critique => self.critique.is_some(),
        }
    }

    /// Lists the present domain fields.
    #[must_use]
    pub fn present_fields(&self) -> Vec<StateField> {
        StateField::ALL
            .iter()
            .copied()
            .filter(|field| self.has(*field))
            .collect()
    }

    /// Applies a single-field update.
    pub fn apply_patch(&mut self, patch: StagePatch) {
        match patch {
            StagePatch::Unchanged => {}
            StagePatch::Intent(intent) => self.intent_result = Some(intent),
            StagePatch::Plan(plan) => self.plan = Some(plan),
            StagePatch::Context(context) => self.context = Some(context),
            StagePatch::Tests(tests) => self.tests = Some(tests),
            StagePatch::Code(code) => self.code = Some(code),
            StagePatch::Validation(report) => self.validation = Some(report),
            StagePatch::Diagnosis(diagnosis) => self.diagnose_result = Some(diagnosis),
            StagePatch::Reflection(reflection) => self.reflection = Some(reflection),
            StagePatch::Critique(critique) => self.critique = Some(critique),
        }
    }

    /// Records an absorbed stage failure.
    pub fn record_failure(&mut self, stage: StageName, kind: StageErrorKind, message: String) {
        let iteration = self.iteration;
        self.failures.push(StageFailure {
            stage,
            kind,
            message,
            iteration,
        });
    }

    /// Collects the results reported in the terminal event.
    #[must_use]
    pub fn results(&self) -> serde_json::Value {
        serde_json::json!({
            "intent": self.intent_result,
            "plan": self.plan,
            "tests": self.tests,
            "code": self.code,
            "validation": self.validation,
            "critique": self.critique,
            "final_response": self.final_response,
            "iteration": self.iteration,
            "model": self.model,
            "model_warning": self.model_warning,
        })
    }

    /// Collects reflection scores plus the critique score.
    #[must_use]
    pub fn scores(&self) -> BTreeMap<String, f64> {
        let mut scores = self
            .reflection
            .as_ref()
            .map(|r| r.scores.clone())
            .unwrap_or_default();
        if let Some(critique) = &self.critique {
            scores.insert("critique".to_string(), critique.score);
        }
        scores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_state_has_id_and_zero_iteration() {
        let state = WorkflowState::new("add two numbers");
        assert_eq!(state.task_id().len(), 32);
        assert_eq!(state.iteration(), 0);
        assert_eq!(state.config.max_iterations, 3);
        assert!(!state.stream);
    }

    #[test]
    fn test_blank_strings_are_absent() {
        let mut state = WorkflowState::new("task");
        state.code = Some("   \n".to_string());
        state.plan = Some("do it".to_string());

        assert!(!state.has(StateField::Code));
        assert!(state.code_is_empty());
        assert_eq!(
            state.present_fields(),
            vec![StateField::Task, StateField::Plan]
        );
    }

    #[test]
    fn test_apply_patch() {
        let mut state = WorkflowState::new("task");
        state.apply_patch(StagePatch::Code("fn main() {}".to_string()));
        state.apply_patch(StagePatch::Validation(ValidationReport::single(
            "lint", true, "",
        )));
        state.apply_patch(StagePatch::Unchanged);

        assert_eq!(state.code.as_deref(), Some("fn main() {}"));
        assert!(state.all_passed());
    }

    #[test]
    fn test_empty_validation_does_not_pass() {
        assert!(!ValidationReport::from_results(vec![]).all_passed);
    }

    #[test]
    fn test_reassert_identity_restores_engine_fields() {
        let original = WorkflowState::new("task");
        let id = original.task_id().to_string();

        let mut replaced = WorkflowState::new("other").with_task_id("evil");
        replaced.begin_repair_pass();
        replaced.begin_repair_pass();
        replaced.reassert_identity(&id, 1);

        assert_eq!(replaced.task_id(), id);
        assert_eq!(replaced.iteration(), 1);
    }

    #[test]
    fn test_scores_include_critique() {
        let mut state = WorkflowState::new("task");
        let mut reflection = Reflection::default();
        reflection.scores.insert("correctness".to_string(), 0.9);
        state.reflection = Some(reflection);
        state.critique = Some(CritiqueReport {
            score: 0.8,
            ..CritiqueReport::default()
        });

        let scores = state.scores();
        assert_eq!(scores.get("correctness"), Some(&0.9));
        assert_eq!(scores.get("critique"), Some(&0.8));
    }

    #[test]
    fn test_state_serde_skips_extras() {
        let mut state = WorkflowState::new("task");
        state
            .extras
            .insert("k".to_string(), ContextValue::Json(serde_json::json!(1)));

        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("extras").is_none());
        assert_eq!(json["task_id"], state.task_id());

        let back: WorkflowState = serde_json::from_value(json).unwrap();
        assert_eq!(back.task_id(), state.task_id());
        assert!(back.extras.is_empty());
    }
}

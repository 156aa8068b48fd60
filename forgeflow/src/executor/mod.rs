//! Stage executor.
//!
//! Every stage call goes through [`StageExecutor::run`], which wraps it with
//! node validation, a resource slot, the stage's circuit breaker, model
//! selection (with the fallback chain on backend failures) and a timeout.
//! Failures never escape: the stage's [`Fallback`] is applied to the
//! pre-stage state and the task continues. Metrics and checkpoint writes are
//! best-effort and their errors are only logged.

mod binding;
mod metrics;

pub use binding::{Fallback, FallbackProducer, StageBinding};
pub use metrics::{
    MetricsRecorder, NoOpMetrics, StageMetrics, StageMetricsSnapshot, StageSample,
};

use crate::checkpoint::TaskCheckpointer;
use crate::config::OrchestratorConfig;
use crate::core::{StageName, StageOutcome, WorkflowState};
use crate::errors::{StageError, StageErrorKind};
use crate::events::{EventSink, ProgressEvent};
use crate::models::ModelSelector;
use crate::observability::StageTimer;
use crate::resilience::{BackoffConfig, CircuitBreakerRegistry};
use crate::validation::NodeValidator;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

/// Collaborators shared by every executor call.
#[derive(Debug, Clone)]
pub struct ExecutorDeps {
    /// Precondition table.
    pub validator: Arc<NodeValidator>,
    /// One breaker per stage name.
    pub breakers: Arc<CircuitBreakerRegistry>,
    /// Model selection; stages get no model when absent.
    pub selector: Option<Arc<ModelSelector>>,
    /// Checkpoint store; nothing is persisted when absent.
    pub checkpointer: Option<Arc<TaskCheckpointer>>,
    /// Stage metrics destination.
    pub metrics: Arc<dyn MetricsRecorder>,
    /// Stage calls allowed in flight.
    pub slots: Arc<Semaphore>,
    /// Pacing between fallback models.
    pub backoff: BackoffConfig,
}

impl ExecutorDeps {
    /// Builds the default collaborators for a configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            validator: Arc::new(NodeValidator::standard()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            selector: None,
            checkpointer: None,
            metrics: Arc::new(StageMetrics::new()),
            slots: Arc::new(Semaphore::new(config.max_concurrent_stages.max(1))),
            backoff: config.fallback_backoff.clone(),
        }
    }

    /// Sets the node validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Arc<NodeValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the breaker registry.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Sets the model selector.
    #[must_use]
    pub fn with_selector(mut self, selector: Arc<ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<TaskCheckpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Sets the metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Sets the fallback backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Runs single stages with fault isolation.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    deps: ExecutorDeps,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(deps: ExecutorDeps) -> Self {
        Self { deps }
    }

    /// Returns the collaborators.
    #[must_use]
    pub fn deps(&self) -> &ExecutorDeps {
        &self.deps
    }

    /// Runs one stage. Never fails: a stage error yields a fallback outcome.
    pub async fn run(
        &self,
        binding: &StageBinding,
        state: WorkflowState,
        sink: &dyn EventSink,
    ) -> StageOutcome {
        let stage = binding.name;
        let task_id = state.task_id().to_string();
        let iteration = state.iteration();
        let stream = state.stream;
        let timer = StageTimer::start(stage, &task_id, iteration);

        if stream {
            sink.emit(ProgressEvent::start(&task_id, stage)).await;
        }

        let mut state = state;
        let result = match self.deps.validator.validate(stage, &state) {
            Err(e) => Err(e),
            Ok(()) => {
                self.assign_model(stage, &mut state).await;
                self.guarded(binding, &state)
                    .instrument(timer.span().clone())
                    .await
            }
        };

        let elapsed = timer.finish();
        let model = state.model.clone();
        let outcome = match result {
            Ok(mut next) => {
                next.reassert_identity(&task_id, iteration);
                StageOutcome::success(stage, next, elapsed)
            }
            Err(e) => {
                log_failure(&task_id, stage, iteration, &e);
                state.apply_patch(binding.fallback.value());
                state.record_failure(stage, e.kind(), e.to_string());
                StageOutcome::fallback(stage, state, elapsed, e)
            }
        }
        .with_model(model);

        info!(
            task_id = %task_id,
            stage = %stage,
            iteration,
            duration_ms = outcome.elapsed_ms(),
            model = outcome.model.as_deref().unwrap_or("-"),
            fallback = !outcome.is_success(),
            "Stage finished"
        );

        let sample = StageSample {
            stage,
            duration: elapsed,
            failure: outcome.failure_kind(),
        };
        if let Err(e) = self.deps.metrics.record(sample) {
            warn!(stage = %stage, error = %e, "Failed to record stage metrics");
        }

        self.checkpoint(&outcome.state, stage).await;

        if stream {
            let detail = serde_json::json!(outcome.to_dict());
            let event = match &outcome.error {
                None => ProgressEvent::end(&task_id, stage, detail),
                Some(e) => {
                    ProgressEvent::stage_error(&task_id, stage, e.to_string()).with_result(detail)
                }
            };
            sink.emit(event).await;
        }

        outcome
    }

    async fn guarded(
        &self,
        binding: &StageBinding,
        state: &WorkflowState,
    ) -> Result<WorkflowState, StageError> {
        let _permit = self
            .deps
            .slots
            .acquire()
            .await
            .map_err(|_| StageError::failed(binding.name.as_str(), "resource slots closed"))?;

        let breaker = self.deps.breakers.get(binding.name.as_str());
        breaker.call(|| self.call_with_models(binding, state)).await
    }

    async fn call_with_models(
        &self,
        binding: &StageBinding,
        state: &WorkflowState,
    ) -> Result<WorkflowState, StageError> {
        match self.call_once(binding, state.clone()).await {
            Err(StageError::BackendUnavailable { model, message }) => {
                self.walk_fallback_chain(binding, state, model, message).await
            }
            other => other,
        }
    }

    // Moves through the selector's fallback chain until a model answers.
    async fn walk_fallback_chain(
        &self,
        binding: &StageBinding,
        state: &WorkflowState,
        model: String,
        message: String,
    ) -> Result<WorkflowState, StageError> {
        let Some(selector) = self.deps.selector.as_ref() else {
            return Err(StageError::BackendUnavailable { model, message });
        };

        let failed = state.model.clone().unwrap_or(model);
        warn!(stage = %binding.name, model = %failed, error = %message, "Backend unavailable");
        selector.mark_unavailable(&failed);

        let task_type = binding.name.task_type();
        let mut tried = vec![failed];
        let mut attempt: u32 = 0;
        loop {
            let Some(next) = selector.fallback_chain(task_type, &tried).into_iter().next() else {
                warn!(stage = %binding.name, tried = ?tried, "Model fallback chain exhausted");
                return Err(StageError::FallbackExhausted {
                    stage: binding.name,
                    tried,
                });
            };

            let delay = self.deps.backoff.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut candidate = state.clone();
            candidate.model = Some(next.clone());
            if let Some(warning) = selector
                .selection_for_model(&next, state.complexity)
                .and_then(|s| s.warning())
            {
                candidate.model_warning = Some(warning);
            }
            info!(stage = %binding.name, model = %next, attempt, "Retrying stage on fallback model");

            match self.call_once(binding, candidate).await {
                Err(StageError::BackendUnavailable { message, .. }) => {
                    debug!(stage = %binding.name, model = %next, error = %message, "Fallback model unavailable");
                    selector.mark_unavailable(&next);
                    tried.push(next);
                }
                other => return other,
            }
        }
    }

    async fn call_once(
        &self,
        binding: &StageBinding,
        state: WorkflowState,
    ) -> Result<WorkflowState, StageError> {
        match tokio::time::timeout(binding.timeout, binding.stage.execute(state)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::timeout(binding.name, binding.timeout)),
        }
    }

    async fn assign_model(&self, stage: StageName, state: &mut WorkflowState) {
        let Some(selector) = self.deps.selector.as_ref() else {
            if let Some(preferred) = &state.config.model_override {
                state.model = Some(preferred.clone());
            }
            return;
        };

        if let Err(e) = selector.ensure_loaded().await {
            warn!(stage = %stage, error = %e, "Model inventory unavailable");
        }

        let selection = selector.select(
            stage.task_type(),
            state.complexity,
            state.config.model_override.as_deref(),
        );
        match selection {
            Some(selection) => {
                if let Some(warning) = selection.warning() {
                    warn!(stage = %stage, model = %selection.model, "{warning}");
                    state.model_warning = Some(warning);
                }
                state.model = Some(selection.model);
            }
            None => debug!(stage = %stage, "No model available; stage runs without one"),
        }
    }

    async fn checkpoint(&self, state: &WorkflowState, stage: StageName) {
        let Some(checkpointer) = self.deps.checkpointer.as_ref() else {
            return;
        };
        if !checkpointer.config().enabled {
            return;
        }

        let limit = checkpointer.config().write_timeout();
        match tokio::time::timeout(limit, checkpointer.save(state, stage)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(task_id = %state.task_id(), stage = %stage, error = %e, "Checkpoint write failed");
            }
            Err(_) => {
                warn!(
                    task_id = %state.task_id(),
                    stage = %stage,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "Checkpoint write timed out"
                );
            }
        }
    }
}

fn log_failure(task_id: &str, stage: StageName, iteration: u32, e: &StageError) {
    match e.kind() {
        StageErrorKind::Precondition | StageErrorKind::CircuitOpen => warn!(
            task_id = %task_id,
            stage = %stage,
            iteration,
            kind = %e.kind(),
            error = %e,
            "Stage skipped; applying fallback"
        ),
        _ => error!(
            task_id = %task_id,
            stage = %stage,
            iteration,
            kind = %e.kind(),
            error = %e,
            "Stage failed; applying fallback"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::core::{StagePatch, TaskType, ValidationReport};
    use crate::events::{CollectingEventSink, EventStatus, NoOpEventSink};
    use crate::models::{ModelInfo, QualityThresholds};
    use crate::resilience::{BreakerConfig, CircuitState};
    use crate::stages::{AsyncFnStage, FnStage, NoOpStage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor() -> StageExecutor {
        StageExecutor::new(ExecutorDeps::from_config(&OrchestratorConfig::default()))
    }

    fn coded_state() -> WorkflowState {
        let mut state = WorkflowState::new("task");
        state.code = Some("fn main() {}".to_string());
        state
    }

    #[tokio::test]
    async fn test_success_updates_state() {
        let stage = FnStage::new("validate", |mut state: WorkflowState| {
            state.validation = Some(ValidationReport::single("unit", true, ""));
            Ok(state)
        });
        let binding = StageBinding::new(StageName::Validate, Arc::new(stage), Duration::from_secs(1));

        let outcome = executor().run(&binding, coded_state(), &NoOpEventSink).await;
        assert!(outcome.is_success());
        assert!(outcome.state.all_passed());
        assert!(outcome.state.failures.is_empty());
    }

    #[tokio::test]
    async fn test_precondition_failure_skips_stage_and_breaker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stage = FnStage::new("validate", move |state: WorkflowState| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(state)
        });
        let binding = StageBinding::new(StageName::Validate, Arc::new(stage), Duration::from_secs(1));
        let executor = executor();

        let outcome = executor
            .run(&binding, WorkflowState::new("task"), &NoOpEventSink)
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.failure_kind(), Some(StageErrorKind::Precondition));
        assert_eq!(outcome.state.validation, Some(ValidationReport::default()));
        assert_eq!(outcome.state.failures.len(), 1);
        assert_eq!(executor.deps().breakers.get("validate").stats().failure_count, 0);
    }

    #[tokio::test]
    async fn test_timeout_applies_fallback() {
        let stage = AsyncFnStage::new("plan", |state: WorkflowState| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(state)
        });
        let binding = StageBinding::new(StageName::Plan, Arc::new(stage), Duration::from_millis(20))
            .with_fallback(Fallback::Constant(StagePatch::Plan("fallback plan".to_string())));
        let mut state = WorkflowState::new("task");
        state.intent_result = Some(crate::core::IntentResult::new("create"));

        let outcome = executor().run(&binding, state, &NoOpEventSink).await;
        assert_eq!(outcome.failure_kind(), Some(StageErrorKind::Timeout));
        assert_eq!(outcome.state.plan.as_deref(), Some("fallback plan"));
    }

    #[tokio::test]
    async fn test_open_breaker_rejects_without_calling_stage() {
        let mut config = OrchestratorConfig::default();
        config.circuit_breaker = BreakerConfig::new(2, Duration::from_secs(60), 1);
        let executor = StageExecutor::new(ExecutorDeps::from_config(&config));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let stage = FnStage::new("critique", move |_state: WorkflowState| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StageError::failed("critique", "boom"))
        });
        let binding = StageBinding::new(StageName::Critique, Arc::new(stage), Duration::from_secs(1));

        for _ in 0..3 {
            let _ = executor.run(&binding, coded_state(), &NoOpEventSink).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let breaker = executor.deps().breakers.get("critique");
        assert_eq!(breaker.state(), CircuitState::Open);

        let outcome = executor.run(&binding, coded_state(), &NoOpEventSink).await;
        assert_eq!(outcome.failure_kind(), Some(StageErrorKind::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stage_cannot_change_task_id() {
        let stage = FnStage::new("reflect", |state: WorkflowState| {
            Ok(state.with_task_id("hijacked"))
        });
        let binding = StageBinding::new(StageName::Reflect, Arc::new(stage), Duration::from_secs(1));
        let mut state = coded_state();
        state.intent_result = Some(crate::core::IntentResult::new("create"));
        let id = state.task_id().to_string();

        let outcome = executor().run(&binding, state, &NoOpEventSink).await;
        assert_eq!(outcome.state.task_id(), id);
    }

    #[tokio::test]
    async fn test_backend_unavailable_walks_fallback_chain() {
        let selector = ModelSelector::with_models(
            vec![
                ModelInfo::new("coder-large", 0.9, 34.0).specialized_for(TaskType::Coding),
                ModelInfo::new("coder-small", 0.6, 7.0).specialized_for(TaskType::Coding),
                ModelInfo::new("general", 0.5, 3.0).light(),
            ],
            QualityThresholds::default(),
        )
        .unwrap();
        let selector = Arc::new(selector);
        let deps = ExecutorDeps::from_config(&OrchestratorConfig::default())
            .with_selector(Arc::clone(&selector))
            .with_backoff(BackoffConfig::none());

        let stage = FnStage::new("generate_code", |mut state: WorkflowState| {
            match state.model.as_deref() {
                Some("general") => {
                    state.code = Some("fn add() {}".to_string());
                    Ok(state)
                }
                Some(model) => Err(StageError::backend_unavailable(model, "connection refused")),
                None => Err(StageError::failed("generate_code", "no model")),
            }
        });
        let binding =
            StageBinding::new(StageName::GenerateCode, Arc::new(stage), Duration::from_secs(1));
        let mut state = WorkflowState::new("task");
        state.plan = Some("plan".to_string());

        let outcome = StageExecutor::new(deps).run(&binding, state, &NoOpEventSink).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.state.model.as_deref(), Some("general"));
        assert_eq!(selector.available(), vec!["general".to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_chain_exhaustion_is_stage_failure() {
        let selector = Arc::new(ModelSelector::with_models(
            vec![ModelInfo::new("only", 0.9, 7.0)],
            QualityThresholds::default(),
        )
        .unwrap());
        let deps = ExecutorDeps::from_config(&OrchestratorConfig::default())
            .with_selector(selector)
            .with_backoff(BackoffConfig::none());
        let stage = FnStage::new("plan", |state: WorkflowState| {
            Err(StageError::backend_unavailable(
                state.model.unwrap_or_default(),
                "down",
            ))
        });
        let binding = StageBinding::new(StageName::Plan, Arc::new(stage), Duration::from_secs(1));
        let mut state = WorkflowState::new("task");
        state.intent_result = Some(crate::core::IntentResult::new("create"));

        let outcome = StageExecutor::new(deps).run(&binding, state, &NoOpEventSink).await;
        match outcome.error {
            Some(StageError::FallbackExhausted { tried, .. }) => {
                assert_eq!(tried, vec!["only".to_string()]);
            }
            other => panic!("expected fallback exhaustion, got {other:?}"),
        }
        assert!(outcome.state.plan.is_some());
    }

    #[tokio::test]
    async fn test_events_and_checkpoint_written() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Arc::new(
            TaskCheckpointer::open(CheckpointConfig::at(dir.path()))
                .await
                .unwrap(),
        );
        let deps = ExecutorDeps::from_config(&OrchestratorConfig::default())
            .with_checkpointer(Arc::clone(&checkpointer));
        let sink = CollectingEventSink::new();
        let binding = StageBinding::new(
            StageName::Intent,
            Arc::new(NoOpStage::new("intent")),
            Duration::from_secs(1),
        );
        let state = WorkflowState::new("add numbers").with_stream(true);
        let id = state.task_id().to_string();

        let outcome = StageExecutor::new(deps).run(&binding, state, &sink).await;
        assert!(outcome.is_success());

        let statuses: Vec<EventStatus> = sink.events().iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![EventStatus::Start, EventStatus::End]);

        let metadata = checkpointer.load_metadata(&id).await.unwrap().unwrap();
        assert_eq!(metadata.last_stage, Some(StageName::Intent));
    }

    #[derive(Debug)]
    struct BrokenMetrics;

    impl MetricsRecorder for BrokenMetrics {
        fn record(&self, _sample: StageSample) -> Result<(), String> {
            Err("metrics backend down".to_string())
        }
    }

    #[tokio::test]
    async fn test_metrics_errors_are_swallowed() {
        let deps = ExecutorDeps::from_config(&OrchestratorConfig::default())
            .with_metrics(Arc::new(BrokenMetrics));
        let binding = StageBinding::new(
            StageName::Intent,
            Arc::new(NoOpStage::new("intent")),
            Duration::from_secs(1),
        );

        let outcome = StageExecutor::new(deps)
            .run(&binding, WorkflowState::new("task"), &NoOpEventSink)
            .await;
        assert!(outcome.is_success());
    }
}

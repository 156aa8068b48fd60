//! The workflow graph: stage order, the repair loop and task lifecycle.
//!
//! ```text
//! intent ─┬─> END                                  (trivial intent)
//!         └─> plan -> research -> generate_tests -> generate_code -> validate
//! validate ─┬─> diagnose -> repair -> validate      (controller: continue)
//!           └─> reflect -> critique -> END          (controller: finish)
//! ```
//!
//! The graph holds no per-task state. Each run starts from a caller-supplied
//! [`WorkflowState`] and returns the final state in a [`TaskRun`]; a graph
//! can drive many tasks concurrently.

mod builder;
mod controller;
mod pause;
mod run;
mod transitions;

pub use builder::WorkflowGraphBuilder;
pub use controller::{FinishReason, RepairDecision, SelfHealingController};
pub use pause::PauseToken;
pub use run::TaskRun;
pub use transitions::{
    next_transition, route_after_intent, route_after_validate, successors, Transition,
};

use crate::checkpoint::{TaskCheckpointer, TaskMetadata};
use crate::config::OrchestratorConfig;
use crate::core::{StageName, TaskStatus, WorkflowState};
use crate::errors::ForgeflowError;
use crate::events::{progress_channel, EventSink, ProgressEvent, ProgressReceiver};
use crate::executor::{StageBinding, StageExecutor};
use crate::resilience::CircuitBreakerRegistry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Reply used when a trivial intent carries none of its own.
pub const TRIVIAL_REPLY: &str = "Hi! Describe a coding task, for example \"write a function \
that adds two numbers\", and I will plan and implement it, then validate the result.";

/// The orchestration engine.
pub struct WorkflowGraph {
    config: OrchestratorConfig,
    bindings: HashMap<StageName, StageBinding>,
    executor: StageExecutor,
    controller: SelfHealingController,
    sink: Arc<dyn EventSink>,
}

impl WorkflowGraph {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> WorkflowGraphBuilder {
        WorkflowGraphBuilder::new(config)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Returns a stage's binding.
    #[must_use]
    pub fn binding(&self, stage: StageName) -> Option<&StageBinding> {
        self.bindings.get(&stage)
    }

    /// Returns the executor.
    #[must_use]
    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Returns the breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.executor.deps().breakers
    }

    /// Returns the checkpoint store, if one is configured and enabled.
    #[must_use]
    pub fn checkpointer(&self) -> Option<&Arc<TaskCheckpointer>> {
        self.executor
            .deps()
            .checkpointer
            .as_ref()
            .filter(|c| c.config().enabled)
    }

    /// Runs a task from the intent stage to the end.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeflowError::Graph`] only for faults in the engine
    /// itself; stage failures are absorbed.
    pub async fn run(&self, state: WorkflowState) -> Result<TaskRun, ForgeflowError> {
        self.run_with_pause(state, &PauseToken::new()).await
    }

    /// Runs a task, stopping at the next stage boundary once `pause` is set.
    pub async fn run_with_pause(
        &self,
        state: WorkflowState,
        pause: &PauseToken,
    ) -> Result<TaskRun, ForgeflowError> {
        self.start(state, pause, self.sink.as_ref()).await
    }

    /// Runs a task with its own bounded progress channel.
    ///
    /// Returns the receiving half and the run future. The stream is forced on
    /// and its events go only to the returned receiver, which must be drained
    /// for the run to deliver its terminal event.
    ///
    /// ```rust,ignore
    /// let (mut events, run) = graph.run_streaming(WorkflowState::new("add"));
    /// let (run, events) = tokio::join!(run, events.collect_until_terminal());
    /// ```
    pub fn run_streaming(
        &self,
        mut state: WorkflowState,
    ) -> (
        ProgressReceiver,
        impl Future<Output = Result<TaskRun, ForgeflowError>> + '_,
    ) {
        let (sink, receiver) = progress_channel(self.config.event_buffer);
        let sink = sink.with_send_timeout(self.config.event_send_timeout());
        state.stream = true;
        let run = async move {
            let pause = PauseToken::new();
            self.start(state, &pause, &sink).await
        };
        (receiver, run)
    }

    async fn start(
        &self,
        mut state: WorkflowState,
        pause: &PauseToken,
        sink: &dyn EventSink,
    ) -> Result<TaskRun, ForgeflowError> {
        state.ensure_task_id();
        info!(
            task_id = %state.task_id(),
            max_iterations = self.max_iterations(&state),
            "Task started"
        );
        self.drive(state, Transition::Stage(StageName::Intent), pause, sink)
            .await
    }

    /// Resumes a checkpointed task at the stage after its last completed one.
    ///
    /// Terminal tasks are returned as loaded without running anything.
    pub async fn resume(&self, task_id: &str) -> Result<TaskRun, ForgeflowError> {
        self.resume_with_pause(task_id, &PauseToken::new()).await
    }

    /// Resumes a task with a pause token.
    pub async fn resume_with_pause(
        &self,
        task_id: &str,
        pause: &PauseToken,
    ) -> Result<TaskRun, ForgeflowError> {
        let Some(checkpointer) = self.checkpointer() else {
            return Err(ForgeflowError::Graph(
                "cannot resume without a checkpoint store".to_string(),
            ));
        };

        let (metadata, state) = match checkpointer.load(task_id).await {
            Ok(Some(found)) => found,
            Ok(None) => return Err(ForgeflowError::TaskNotFound(task_id.to_string())),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Checkpoint unreadable; failing task");
                if let Err(mark) = checkpointer.mark_failed(task_id).await {
                    warn!(task_id = %task_id, error = %mark, "Failed to mark task failed");
                }
                return Err(e.into());
            }
        };

        if metadata.status.is_terminal() {
            info!(task_id = %task_id, status = %metadata.status, "Task already finished");
            return Ok(TaskRun::new(state, metadata.status, Vec::new()));
        }

        let start = match metadata.last_stage {
            None => Transition::Stage(StageName::Intent),
            Some(last) => {
                next_transition(last, &state, &self.controller, self.max_iterations(&state))
            }
        };
        info!(
            task_id = %task_id,
            last_stage = metadata.last_stage.map_or("-", |s| s.as_str()),
            next = %start,
            iteration = state.iteration(),
            "Resuming task"
        );
        if let Err(e) = checkpointer.mark_running(task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to mark task running");
        }

        self.drive(state, start, pause, self.sink.as_ref()).await
    }

    /// Lists running and paused tasks, newest first.
    pub async fn list_active(&self) -> Result<Vec<TaskMetadata>, ForgeflowError> {
        match self.checkpointer() {
            Some(checkpointer) => Ok(checkpointer.list_active().await?),
            None => Ok(Vec::new()),
        }
    }

    fn max_iterations(&self, state: &WorkflowState) -> u32 {
        self.config.effective_max_iterations(state.config.max_iterations)
    }

    async fn drive(
        &self,
        mut state: WorkflowState,
        start: Transition,
        pause: &PauseToken,
        sink: &dyn EventSink,
    ) -> Result<TaskRun, ForgeflowError> {
        let max_iterations = self.max_iterations(&state);
        let step_limit = max_steps(max_iterations);
        let mut visited = Vec::new();
        let mut next = start;

        while let Transition::Stage(stage) = next {
            if pause.is_paused() {
                return Ok(self.pause_task(state, visited, pause.reason(), sink).await);
            }
            if visited.len() >= step_limit {
                let message = format!("step limit {step_limit} exceeded at stage '{stage}'");
                return Err(self.fail_task(&state, message, sink).await);
            }
            let Some(binding) = self.bindings.get(&stage) else {
                let message = format!("no binding for stage '{stage}'");
                return Err(self.fail_task(&state, message, sink).await);
            };

            if stage == StageName::Repair {
                state.begin_repair_pass();
                debug!(
                    task_id = %state.task_id(),
                    iteration = state.iteration(),
                    "Repair pass started"
                );
            }

            state = self.executor.run(binding, state, sink).await.state;
            visited.push(stage);
            next = next_transition(stage, &state, &self.controller, max_iterations);
        }

        Ok(self.complete_task(state, visited, sink).await)
    }

    async fn complete_task(
        &self,
        mut state: WorkflowState,
        visited: Vec<StageName>,
        sink: &dyn EventSink,
    ) -> TaskRun {
        if state.is_trivial() && state.final_response.is_none() {
            let reply = state
                .intent_result
                .as_ref()
                .and_then(|i| i.reply.clone())
                .unwrap_or_else(|| TRIVIAL_REPLY.to_string());
            state.final_response = Some(reply);
        }

        if let Some(checkpointer) = self.checkpointer() {
            if state.final_response.is_some() {
                if let Some(last) = visited.last() {
                    if let Err(e) = checkpointer.save(&state, *last).await {
                        warn!(task_id = %state.task_id(), error = %e, "Final checkpoint failed");
                    }
                }
            }
            if let Err(e) = checkpointer.mark_completed(state.task_id()).await {
                warn!(task_id = %state.task_id(), error = %e, "Failed to mark task completed");
            }
        }

        info!(
            task_id = %state.task_id(),
            all_passed = state.all_passed(),
            iteration = state.iteration(),
            stages = visited.len(),
            fallbacks = state.failures.len(),
            "Task completed"
        );
        if state.stream {
            sink.emit(ProgressEvent::complete(&state, TaskStatus::Completed))
                .await;
        }
        TaskRun::new(state, TaskStatus::Completed, visited)
    }

    async fn pause_task(
        &self,
        state: WorkflowState,
        visited: Vec<StageName>,
        reason: Option<String>,
        sink: &dyn EventSink,
    ) -> TaskRun {
        info!(
            task_id = %state.task_id(),
            reason = reason.as_deref().unwrap_or("-"),
            last_stage = visited.last().map_or("-", |s| s.as_str()),
            "Task paused"
        );
        if let Some(checkpointer) = self.checkpointer() {
            if let Err(e) = checkpointer.mark_paused(state.task_id()).await {
                warn!(task_id = %state.task_id(), error = %e, "Failed to mark task paused");
            }
        }
        if state.stream {
            sink.emit(ProgressEvent::complete(&state, TaskStatus::Paused))
                .await;
        }
        TaskRun::new(state, TaskStatus::Paused, visited)
    }

    async fn fail_task(
        &self,
        state: &WorkflowState,
        message: String,
        sink: &dyn EventSink,
    ) -> ForgeflowError {
        error!(task_id = %state.task_id(), error = %message, "Task failed");
        if let Some(checkpointer) = self.checkpointer() {
            if let Err(e) = checkpointer.mark_failed(state.task_id()).await {
                warn!(task_id = %state.task_id(), error = %e, "Failed to mark task failed");
            }
        }
        if state.stream {
            sink.emit(ProgressEvent::failed(state.task_id(), message.clone()))
                .await;
        }
        ForgeflowError::Graph(message)
    }
}

// Linear stages plus one repair cycle per iteration and one more validate.
fn max_steps(max_iterations: u32) -> usize {
    let iterations = usize::try_from(max_iterations).unwrap_or(usize::MAX);
    StageName::ALL
        .len()
        .saturating_add(iterations.saturating_mul(3))
        .saturating_add(1)
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("stages", &self.bindings.len())
            .field("max_iterations", &self.config.max_iterations)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IntentResult, ValidationReport};
    use crate::stages::{FnStage, NoOpStage};

    fn graph_with(validate_passes: bool, intent: IntentResult) -> WorkflowGraph {
        let mut builder = WorkflowGraph::builder(OrchestratorConfig::default());
        for name in StageName::ALL {
            builder = builder.stage(name, Arc::new(NoOpStage::new(name.as_str())));
        }
        builder
            .stage(
                StageName::Intent,
                Arc::new(FnStage::new("intent", move |mut state: WorkflowState| {
                    state.intent_result = Some(intent.clone());
                    Ok(state)
                })),
            )
            .stage(
                StageName::Plan,
                Arc::new(FnStage::new("plan", |mut state: WorkflowState| {
                    state.plan = Some("1. add the numbers".to_string());
                    Ok(state)
                })),
            )
            .stage(
                StageName::GenerateCode,
                Arc::new(FnStage::new("code", |mut state: WorkflowState| {
                    state.code = Some("fn add(a: i32, b: i32) -> i32 { a + b }".to_string());
                    Ok(state)
                })),
            )
            .stage(
                StageName::Validate,
                Arc::new(FnStage::new("validate", move |mut state: WorkflowState| {
                    state.validation =
                        Some(ValidationReport::single("unit", validate_passes, "checked"));
                    Ok(state)
                })),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_visits_every_linear_stage() {
        let graph = graph_with(true, IntentResult::new("create"));
        let run = graph.run(WorkflowState::new("add numbers")).await.unwrap();

        assert_eq!(run.status, TaskStatus::Completed);
        assert!(run.all_passed());
        assert_eq!(run.iteration(), 0);
        assert!(run.state.failures.is_empty(), "{:?}", run.state.failures);
        assert_eq!(
            run.visited,
            vec![
                StageName::Intent,
                StageName::Plan,
                StageName::Research,
                StageName::GenerateTests,
                StageName::GenerateCode,
                StageName::Validate,
                StageName::Reflect,
                StageName::Critique,
            ]
        );
    }

    #[tokio::test]
    async fn test_trivial_intent_gets_canned_reply() {
        let graph = graph_with(true, IntentResult::trivial("greeting", None));
        let run = graph.run(WorkflowState::new("hi")).await.unwrap();

        assert_eq!(run.visited, vec![StageName::Intent]);
        assert_eq!(run.final_response(), Some(TRIVIAL_REPLY));
    }

    #[tokio::test]
    async fn test_failing_validation_stops_at_cap() {
        let graph = graph_with(false, IntentResult::new("create"));
        let run = graph
            .run(WorkflowState::new("task").with_max_iterations(2))
            .await
            .unwrap();

        assert_eq!(run.status, TaskStatus::Completed);
        assert!(!run.all_passed());
        assert_eq!(run.iteration(), 2);
        assert_eq!(run.times_visited(StageName::Repair), 2);
        assert_eq!(run.times_visited(StageName::Validate), 3);
        assert_eq!(run.visited.last(), Some(&StageName::Critique));
    }

    #[tokio::test]
    async fn test_pause_before_start() {
        let graph = graph_with(true, IntentResult::new("create"));
        let pause = PauseToken::new();
        pause.pause("operator");

        let run = graph
            .run_with_pause(WorkflowState::new("task"), &pause)
            .await
            .unwrap();
        assert_eq!(run.status, TaskStatus::Paused);
        assert!(run.visited.is_empty());
    }

    #[tokio::test]
    async fn test_resume_requires_checkpointer() {
        let graph = graph_with(true, IntentResult::new("create"));
        assert!(matches!(
            graph.resume("abc").await,
            Err(ForgeflowError::Graph(_))
        ));
    }

    #[test]
    fn test_max_steps_covers_loop() {
        assert_eq!(max_steps(3), 20);
        assert!(max_steps(u32::MAX) > 0);
    }
}

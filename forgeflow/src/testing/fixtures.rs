//! A complete engine wired with mock stages, for tests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::{stage_log, RecordingStage, ScriptedStage, StageLog, StaticValidator};
use crate::checkpoint::CheckpointConfig;
use crate::config::OrchestratorConfig;
use crate::core::{
    CritiqueReport, Diagnosis, IntentResult, Reflection, StageName, StagePatch, WorkflowState,
};
use crate::errors::ForgeflowError;
use crate::events::CollectingEventSink;
use crate::executor::StageMetrics;
use crate::graph::WorkflowGraph;
use crate::models::ModelSelector;
use crate::resilience::{BackoffConfig, CircuitBreakerRegistry};
use crate::stages::{Stage, ValidatorSuite};

/// Code produced by the happy-path `generate_code` stage.
pub const SAMPLE_CODE: &str = "fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";

/// Code produced by the happy-path `repair` stage.
pub const REPAIRED_CODE: &str = "fn add(a: i32, b: i32) -> i32 {\n    a.wrapping_add(b)\n}\n";

/// Stages that take every task down the linear path with passing validation.
#[must_use]
pub fn happy_path_stages() -> HashMap<StageName, Arc<dyn Stage>> {
    let mut scores = BTreeMap::new();
    scores.insert("correctness".to_string(), 0.9);
    scores.insert("style".to_string(), 0.8);

    let patches = [
        (StageName::Intent, StagePatch::Intent(IntentResult::new("create"))),
        (
            StageName::Plan,
            StagePatch::Plan("1. Define add(a, b).\n2. Return the sum.".to_string()),
        ),
        (StageName::Research, StagePatch::Context("integer addition".to_string())),
        (
            StageName::GenerateTests,
            StagePatch::Tests("assert_eq!(add(1, 2), 3);".to_string()),
        ),
        (StageName::GenerateCode, StagePatch::Code(SAMPLE_CODE.to_string())),
        (
            StageName::Diagnose,
            StagePatch::Diagnosis(Diagnosis {
                summary: "test failed".to_string(),
                root_cause: "wrong operator".to_string(),
                suggested_fix: "use addition".to_string(),
            }),
        ),
        (StageName::Repair, StagePatch::Code(REPAIRED_CODE.to_string())),
        (
            StageName::Reflect,
            StagePatch::Reflection(Reflection {
                scores,
                summary: "meets the task".to_string(),
            }),
        ),
        (
            StageName::Critique,
            StagePatch::Critique(CritiqueReport {
                score: 0.85,
                issues: Vec::new(),
                summary: "good".to_string(),
            }),
        ),
    ];

    let mut stages: HashMap<StageName, Arc<dyn Stage>> = patches
        .into_iter()
        .map(|(name, patch)| {
            let stage: Arc<dyn Stage> = Arc::new(ScriptedStage::always(name.as_str(), patch));
            (name, stage)
        })
        .collect();
    stages.insert(
        StageName::Validate,
        Arc::new(ValidatorSuite::new().with_validator(Arc::new(StaticValidator::passing("unit")))),
    );
    stages
}

/// Builds a [`WorkflowGraph`] over a checkpoint directory with mock stages,
/// recording every stage call and collecting every event.
pub struct TestHarness {
    /// Engine configuration. Checkpoints live under the harness root.
    pub config: OrchestratorConfig,
    /// Stage names in call order, shared by every graph the harness builds.
    pub log: StageLog,
    /// Collected progress events.
    pub sink: Arc<CollectingEventSink>,
    /// Stage metrics.
    pub metrics: Arc<StageMetrics>,
    stages: HashMap<StageName, Arc<dyn Stage>>,
    timeouts: HashMap<StageName, Duration>,
    selector: Option<Arc<ModelSelector>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
}

impl TestHarness {
    /// Creates a harness whose checkpoints are written under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let config = OrchestratorConfig::default()
            .with_checkpoint(CheckpointConfig::at(root.into()))
            .with_fallback_backoff(BackoffConfig::none());
        Self {
            config,
            log: stage_log(),
            sink: Arc::new(CollectingEventSink::new()),
            metrics: Arc::new(StageMetrics::new()),
            stages: happy_path_stages(),
            timeouts: HashMap::new(),
            selector: None,
            breakers: None,
        }
    }

    /// Replaces one stage.
    #[must_use]
    pub fn with_stage(mut self, name: StageName, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(name, stage);
        self
    }

    /// Overrides one stage's timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, name: StageName, timeout: Duration) -> Self {
        self.timeouts.insert(name, timeout);
        self
    }

    /// Edits the configuration.
    #[must_use]
    pub fn with_config(mut self, edit: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    /// Uses a model selector.
    #[must_use]
    pub fn with_selector(mut self, selector: Arc<ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Shares a breaker registry between graphs.
    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Builds the graph.
    pub async fn build(&self) -> Result<WorkflowGraph, ForgeflowError> {
        let mut builder = WorkflowGraph::builder(self.config.clone())
            .event_sink(self.sink.clone())
            .metrics(self.metrics.clone());
        for (name, stage) in &self.stages {
            let recorded = RecordingStage::new(name.as_str(), Arc::clone(stage), Arc::clone(&self.log));
            builder = builder.stage(*name, Arc::new(recorded));
        }
        for (name, timeout) in &self.timeouts {
            builder = builder.stage_timeout(*name, *timeout);
        }
        if let Some(selector) = &self.selector {
            builder = builder.model_selector(Arc::clone(selector));
        }
        if let Some(breakers) = &self.breakers {
            builder = builder.breakers(Arc::clone(breakers));
        }
        builder.open_checkpoints().await?.build()
    }

    /// Returns the recorded stage calls.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    /// Returns how many times a stage was called.
    #[must_use]
    pub fn call_count(&self, stage: StageName) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|s| s.as_str() == stage.as_str())
            .count()
    }
}

/// A streaming task state.
#[must_use]
pub fn sample_state(task: &str) -> WorkflowState {
    WorkflowState::new(task).with_stream(true)
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("checkpoints", &self.config.checkpoint.dir)
            .field("calls", &self.log.lock().len())
            .field("events", &self.sink.len())
            .finish_non_exhaustive()
    }
}

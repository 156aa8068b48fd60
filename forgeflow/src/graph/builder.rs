//! Builder wiring stages and collaborators into a [`WorkflowGraph`].

use super::{SelfHealingController, WorkflowGraph};
use crate::checkpoint::TaskCheckpointer;
use crate::config::OrchestratorConfig;
use crate::core::StageName;
use crate::errors::{ConfigError, ForgeflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::{ExecutorDeps, Fallback, MetricsRecorder, StageBinding, StageExecutor};
use crate::models::{ModelInventory, ModelSelector};
use crate::resilience::CircuitBreakerRegistry;
use crate::stages::Stage;
use crate::validation::NodeValidator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Builder for a [`WorkflowGraph`].
///
/// Every one of the ten stages must be bound; everything else is optional.
#[derive(Default)]
pub struct WorkflowGraphBuilder {
    config: OrchestratorConfig,
    stages: HashMap<StageName, Arc<dyn Stage>>,
    fallbacks: HashMap<StageName, Fallback>,
    timeouts: HashMap<StageName, Duration>,
    inventory: Option<Arc<dyn ModelInventory>>,
    selector: Option<Arc<ModelSelector>>,
    checkpointer: Option<Arc<TaskCheckpointer>>,
    sink: Option<Arc<dyn EventSink>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    metrics: Option<Arc<dyn MetricsRecorder>>,
    validator: Option<Arc<NodeValidator>>,
}

impl WorkflowGraphBuilder {
    /// Creates a builder for a configuration.
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Binds a stage implementation.
    #[must_use]
    pub fn stage(mut self, name: StageName, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(name, stage);
        self
    }

    /// Overrides a stage's fallback value.
    #[must_use]
    pub fn fallback(mut self, name: StageName, fallback: Fallback) -> Self {
        self.fallbacks.insert(name, fallback);
        self
    }

    /// Overrides a stage's timeout.
    #[must_use]
    pub fn stage_timeout(mut self, name: StageName, timeout: Duration) -> Self {
        self.timeouts.insert(name, timeout);
        self
    }

    /// Selects models from an inventory, using the configured thresholds and light model.
    #[must_use]
    pub fn model_inventory(mut self, inventory: Arc<dyn ModelInventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Uses a ready-made selector. Takes precedence over [`model_inventory`](Self::model_inventory).
    #[must_use]
    pub fn model_selector(mut self, selector: Arc<ModelSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Uses a checkpoint store.
    #[must_use]
    pub fn checkpointer(mut self, checkpointer: Arc<TaskCheckpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Opens the checkpoint store described by the configuration, if enabled.
    pub async fn open_checkpoints(mut self) -> Result<Self, ForgeflowError> {
        if self.config.checkpoint.enabled {
            let checkpointer = TaskCheckpointer::open(self.config.checkpoint.clone()).await?;
            self.checkpointer = Some(Arc::new(checkpointer));
        }
        Ok(self)
    }

    /// Sends progress events to a sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Shares a breaker registry, e.g. with another engine.
    #[must_use]
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Records stage metrics.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replaces the precondition table.
    #[must_use]
    pub fn node_validator(mut self, validator: Arc<NodeValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validates the configuration and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config is invalid or a stage is unbound.
    pub fn build(self) -> Result<WorkflowGraph, ForgeflowError> {
        self.config.validate()?;

        let mut bindings = HashMap::with_capacity(StageName::ALL.len());
        for name in StageName::ALL {
            let stage = self
                .stages
                .get(&name)
                .cloned()
                .ok_or(ConfigError::MissingStage(name))?;
            let timeout = self
                .timeouts
                .get(&name)
                .copied()
                .unwrap_or_else(|| self.config.stage_timeout(name));
            let mut binding = StageBinding::new(name, stage, timeout);
            if let Some(fallback) = self.fallbacks.get(&name) {
                binding = binding.with_fallback(fallback.clone());
            }
            bindings.insert(name, binding);
        }

        let selector = match (self.selector, self.inventory) {
            (Some(selector), _) => Some(selector),
            (None, Some(inventory)) => Some(Arc::new(
                ModelSelector::new(inventory, self.config.quality_thresholds)?
                    .with_light_model(self.config.light_model.clone()),
            )),
            (None, None) => None,
        };

        let mut deps = ExecutorDeps::from_config(&self.config);
        if let Some(selector) = selector {
            deps = deps.with_selector(selector);
        }
        if let Some(checkpointer) = self.checkpointer {
            deps = deps.with_checkpointer(checkpointer);
        }
        if let Some(breakers) = self.breakers {
            deps = deps.with_breakers(breakers);
        }
        if let Some(metrics) = self.metrics {
            deps = deps.with_metrics(metrics);
        }
        if let Some(validator) = self.validator {
            deps = deps.with_validator(validator);
        }

        tracing::debug!(
            stages = bindings.len(),
            max_iterations = self.config.max_iterations,
            checkpoints = deps.checkpointer.is_some(),
            models = deps.selector.is_some(),
            "Workflow graph built"
        );

        Ok(WorkflowGraph {
            config: self.config,
            bindings,
            executor: StageExecutor::new(deps),
            controller: SelfHealingController::new(),
            sink: self.sink.unwrap_or_else(|| Arc::new(NoOpEventSink)),
        })
    }
}

impl std::fmt::Debug for WorkflowGraphBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bound: Vec<&str> = self.stages.keys().map(StageName::as_str).collect();
        bound.sort_unstable();
        f.debug_struct("WorkflowGraphBuilder")
            .field("stages", &bound)
            .field("checkpointer", &self.checkpointer.is_some())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QualityThresholds;
    use crate::stages::NoOpStage;

    fn all_stages(mut builder: WorkflowGraphBuilder) -> WorkflowGraphBuilder {
        for name in StageName::ALL {
            builder = builder.stage(name, Arc::new(NoOpStage::new(name.as_str())));
        }
        builder
    }

    #[test]
    fn test_missing_stage_is_config_error() {
        let result = WorkflowGraphBuilder::new(OrchestratorConfig::default())
            .stage(StageName::Intent, Arc::new(NoOpStage::new("intent")))
            .build();
        assert!(matches!(
            result,
            Err(ForgeflowError::Config(ConfigError::MissingStage(StageName::Plan)))
        ));
    }

    #[test]
    fn test_non_monotonic_thresholds_fail_build() {
        let config = OrchestratorConfig::default()
            .with_quality_thresholds(QualityThresholds::new(0.8, 0.5, 0.9));
        let result = all_stages(WorkflowGraphBuilder::new(config)).build();
        assert!(matches!(
            result,
            Err(ForgeflowError::Config(ConfigError::NonMonotonicThresholds { .. }))
        ));
    }

    #[test]
    fn test_timeout_override() {
        let graph = all_stages(WorkflowGraphBuilder::new(OrchestratorConfig::default()))
            .stage_timeout(StageName::Validate, Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(
            graph.binding(StageName::Validate).map(|b| b.timeout),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            graph.binding(StageName::Plan).map(|b| b.timeout),
            Some(Duration::from_secs(120))
        );
    }
}

//! # Forgeflow
//!
//! A self-healing orchestration engine for task-to-code pipelines.
//!
//! A task flows through a fixed graph of stages (intent, plan, research,
//! test and code generation, validation, reflection and critique). When
//! validation fails the engine loops through diagnose and repair until the
//! checks pass or the iteration cap is hit. Around every stage call it
//! provides:
//!
//! - **Fault isolation**: one circuit breaker per stage, shared by all tasks
//! - **Graceful degradation**: every failure is absorbed by a fallback value
//! - **Adaptive model selection**: quality floors per complexity class and a
//!   fallback chain when a backend model is unreachable
//! - **Crash-safe checkpoints**: resume a task from its last completed stage
//! - **Progress events**: an ordered stream per task for streaming observers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use forgeflow::prelude::*;
//!
//! let graph = WorkflowGraph::builder(OrchestratorConfig::default())
//!     .stage(StageName::Intent, Arc::new(IntentStage::new(client.clone())))
//!     // ... one binding per stage ...
//!     .stage(StageName::Validate, Arc::new(ValidatorSuite::new().with_validator(rustc)))
//!     .open_checkpoints()
//!     .await?
//!     .build()?;
//!
//! let run = graph.run(WorkflowState::new("write a function that adds two numbers")).await?;
//! println!("passed: {}", run.all_passed());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph;
pub mod models;
pub mod observability;
pub mod resilience;
pub mod stages;
pub mod testing;
pub mod validation;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{CheckpointConfig, TaskCheckpointer, TaskMetadata};
    pub use crate::config::{OrchestratorConfig, GLOBAL_MAX_ITERATIONS};
    pub use crate::core::{
        Complexity, IntentResult, StageName, StageOutcome, StagePatch, TaskStatus, TaskType,
        ValidationReport, ValidatorResult, WorkflowState,
    };
    pub use crate::errors::{CheckpointError, ConfigError, ForgeflowError, StageError};
    pub use crate::events::{
        progress_channel, CollectingEventSink, EventSink, EventStatus, LoggingEventSink,
        NoOpEventSink, ProgressEvent,
    };
    pub use crate::executor::{Fallback, StageBinding, StageExecutor, StageMetrics};
    pub use crate::graph::{PauseToken, SelfHealingController, TaskRun, WorkflowGraph};
    pub use crate::models::{ModelInfo, ModelInventory, ModelSelector, QualityThresholds};
    pub use crate::resilience::{BreakerConfig, CircuitBreakerRegistry, CircuitState};
    pub use crate::stages::{FnStage, Stage, Validator, ValidatorSuite};
    pub use crate::validation::NodeValidator;
    pub use std::sync::Arc;
}

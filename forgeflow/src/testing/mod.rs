//! Testing utilities for forgeflow engines.
//!
//! This module provides:
//! - Scripted, failing, slow and recording mock stages
//! - Fixed and sequenced mock validators
//! - A harness wiring a full graph over a temporary checkpoint directory
//! - Assertions over task runs and event streams

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_completed, assert_event_stream, assert_not_visited, assert_visited};
pub use fixtures::{happy_path_stages, sample_state, TestHarness, REPAIRED_CODE, SAMPLE_CODE};
pub use mocks::{
    stage_log, FailingStage, RecordingStage, ScriptedStage, SequenceValidator, SlowStage,
    StageLog, StaticValidator,
};

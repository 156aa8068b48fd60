//! Crash-safe task checkpoints.
//!
//! After every stage the executor persists the state so a task can resume
//! from its last completed stage after a restart. Persistence is best-effort
//! from the pipeline's point of view; callers log and drop write errors.

mod metadata;
mod serialize;
mod store;

pub use metadata::{truncate_preview, TaskMetadata};
pub use serialize::{
    encode_value, full_record, is_minimal, minimal_record, state_from_json, state_to_json,
    CIRCULAR_MARKER,
};
pub use store::{CheckpointConfig, TaskCheckpointer};

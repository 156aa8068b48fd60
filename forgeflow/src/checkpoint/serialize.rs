//! Fallback-safe state serialization.
//!
//! The typed part of [`WorkflowState`] goes through serde. Extension values
//! are encoded by hand: objects become plain mappings, enumerations become
//! their underlying value, and a shared handle already on the current path is
//! replaced by [`CIRCULAR_MARKER`]. If anything still fails, a minimal record
//! of the primitive fields is written instead.

use crate::core::{ContextValue, WorkflowState};
use crate::errors::CheckpointError;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Written in place of a value that refers back to one of its ancestors.
pub const CIRCULAR_MARKER: &str = "<circular reference>";

const MAX_DEPTH: usize = 64;
const EXTRAS_KEY: &str = "extras";
const MINIMAL_KEY: &str = "minimal";
const PRIMITIVE_FIELDS: [&str; 10] = [
    "task_id",
    "task",
    "iteration",
    "stream",
    "plan",
    "context",
    "tests",
    "code",
    "final_response",
    "model",
];

/// Encodes one extension value.
pub fn encode_value(value: &ContextValue) -> Result<Value, CheckpointError> {
    let mut path = Vec::new();
    encode(value, &mut path, 0)
}

fn encode(
    value: &ContextValue,
    path: &mut Vec<*const RwLock<ContextValue>>,
    depth: usize,
) -> Result<Value, CheckpointError> {
    if depth > MAX_DEPTH {
        return Err(CheckpointError::Serialization(format!(
            "extension value nested deeper than {MAX_DEPTH} levels"
        )));
    }

    match value {
        ContextValue::Json(json) => Ok(json.clone()),
        ContextValue::Enum { value, .. } => Ok(value.clone()),
        ContextValue::Opaque { repr, .. } => Ok(Value::String(repr.clone())),
        ContextValue::List(items) => items
            .iter()
            .map(|item| encode(item, path, depth + 1))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        ContextValue::Object { fields, .. } => {
            let mut map = Map::new();
            for (key, field) in fields {
                map.insert(key.clone(), encode(field, path, depth + 1)?);
            }
            Ok(Value::Object(map))
        }
        ContextValue::Shared(handle) => {
            let ptr = Arc::as_ptr(handle);
            if path.contains(&ptr) {
                return Ok(Value::String(CIRCULAR_MARKER.to_string()));
            }
            path.push(ptr);
            let encoded = encode(&handle.read(), path, depth + 1);
            path.pop();
            encoded
        }
    }
}

/// Serializes the full state, extension values included.
pub fn full_record(state: &WorkflowState) -> Result<Value, CheckpointError> {
    let mut record = serde_json::to_value(state)?;

    let mut extras = Map::new();
    for (key, value) in &state.extras {
        extras.insert(key.clone(), encode_value(value)?);
    }

    match record.as_object_mut() {
        Some(map) => {
            map.insert(EXTRAS_KEY.to_string(), Value::Object(extras));
            Ok(record)
        }
        None => Err(CheckpointError::Serialization(
            "state did not serialize to an object".to_string(),
        )),
    }
}

/// Builds the record of guaranteed-primitive fields.
#[must_use]
pub fn minimal_record(state: &WorkflowState) -> Value {
    serde_json::json!({
        MINIMAL_KEY: true,
        "task_id": state.task_id(),
        "task": state.task,
        "iteration": state.iteration(),
        "stream": state.stream,
        "config": { "max_iterations": state.config.max_iterations },
        "plan": state.plan,
        "context": state.context,
        "tests": state.tests,
        "code": state.code,
        "final_response": state.final_response,
        "model": state.model,
    })
}

/// Serializes the state, falling back to the minimal record.
///
/// Returns the record and whether the fallback was used.
#[must_use]
pub fn state_to_json(state: &WorkflowState) -> (Value, bool) {
    match full_record(state) {
        Ok(record) => (record, false),
        Err(e) => {
            tracing::warn!(
                task_id = %state.task_id(),
                error = %e,
                "Full state serialization failed; writing minimal record"
            );
            (minimal_record(state), true)
        }
    }
}

/// Rebuilds a state from either record form. Missing fields take defaults.
///
/// A full record whose typed fields no longer load is read back through the
/// fields the minimal record keeps.
pub fn state_from_json(mut record: Value) -> Result<WorkflowState, CheckpointError> {
    let extras = record
        .as_object_mut()
        .and_then(|map| {
            map.remove(MINIMAL_KEY);
            map.remove(EXTRAS_KEY)
        })
        .and_then(|extras| match extras {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    let mut state = match WorkflowState::deserialize(&record) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Typed state load failed; rebuilding from primitive fields"
            );
            let mut primitives: Map<String, Value> = PRIMITIVE_FIELDS
                .iter()
                .filter_map(|key| record.get(*key).map(|value| (key.to_string(), value.clone())))
                .collect();
            if let Some(max) = record.pointer("/config/max_iterations") {
                let config = serde_json::json!({ "max_iterations": max });
                primitives.insert("config".to_string(), config);
            }
            WorkflowState::deserialize(&Value::Object(primitives))?
        }
    };
    state.extras = extras
        .into_iter()
        .map(|(key, value)| (key, ContextValue::Json(value)))
        .collect();
    Ok(state)
}

/// Returns true if a stored record is the minimal form.
#[must_use]
pub fn is_minimal(record: &Value) -> bool {
    record.get(MINIMAL_KEY).and_then(Value::as_bool).unwrap_or(false)
}

//! Dynamic extension values carried alongside the typed workflow state.
//!
//! Stages occasionally need to stash data the typed fields do not model
//! (parsed ASTs, retrieval hits, tool handles). Such values may share
//! structure through [`SharedValue`] handles and may even refer back to
//! themselves, so nothing in this module may recurse through a shared handle
//! without tracking identity.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A shared, mutable handle to a [`ContextValue`].
pub type SharedValue = Arc<RwLock<ContextValue>>;

/// A dynamically-typed value stored in [`WorkflowState::extras`](super::WorkflowState).
#[derive(Clone)]
pub enum ContextValue {
    /// Plain JSON data.
    Json(serde_json::Value),
    /// An enumeration; persisted as its underlying value.
    Enum {
        /// Enumeration type name.
        type_name: String,
        /// Variant name.
        variant: String,
        /// Underlying value.
        value: serde_json::Value,
    },
    /// A structured object; persisted as a plain mapping of its fields.
    Object {
        /// Object type name.
        type_name: String,
        /// Field values.
        fields: BTreeMap<String, ContextValue>,
    },
    /// An ordered list.
    List(Vec<ContextValue>),
    /// A shared handle, possibly part of a cycle.
    Shared(SharedValue),
    /// A value with no structured form; persisted as its description.
    Opaque {
        /// Type name.
        type_name: String,
        /// Human-readable description.
        repr: String,
    },
}

impl ContextValue {
    /// Wraps a value in a new shared handle.
    #[must_use]
    pub fn shared(value: Self) -> SharedValue {
        Arc::new(RwLock::new(value))
    }

    /// Creates an object value.
    #[must_use]
    pub fn object(
        type_name: impl Into<String>,
        fields: impl IntoIterator<Item = (String, ContextValue)>,
    ) -> Self {
        Self::Object {
            type_name: type_name.into(),
            fields: fields.into_iter().collect(),
        }
    }

    /// Creates an enumeration value.
    #[must_use]
    pub fn enumeration(
        type_name: impl Into<String>,
        variant: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self::Enum {
            type_name: type_name.into(),
            variant: variant.into(),
            value,
        }
    }

    /// Returns the JSON payload if this is a plain JSON value.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Returns a short type label, used for debugging output.
    #[must_use]
    pub fn type_label(&self) -> &str {
        match self {
            Self::Json(_) => "json",
            Self::Enum { type_name, .. }
            | Self::Object { type_name, .. }
            | Self::Opaque { type_name, .. } => type_name,
            Self::List(_) => "list",
            Self::Shared(_) => "shared",
        }
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

// Shared handles are printed by address; following them could loop forever.
impl fmt::Debug for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Self::Enum {
                type_name,
                variant,
                value,
            } => f
                .debug_struct("Enum")
                .field("type_name", type_name)
                .field("variant", variant)
                .field("value", value)
                .finish(),
            Self::Object { type_name, fields } => f
                .debug_struct("Object")
                .field("type_name", type_name)
                .field("fields", fields)
                .finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Shared(handle) => write!(f, "Shared({:p})", Arc::as_ptr(handle)),
            Self::Opaque { type_name, repr } => f
                .debug_struct("Opaque")
                .field("type_name", type_name)
                .field("repr", repr)
                .finish(),
        }
    }
}

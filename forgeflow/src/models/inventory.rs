//! Backend model metadata and the inventory seam.

use crate::core::TaskType;
use crate::errors::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A reachable backend model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as the backend knows it.
    pub name: String,
    /// Quality estimate in [0, 1].
    pub quality: f64,
    /// Parameter count in billions.
    pub size_b: f64,
    /// Task types the model is tuned for.
    #[serde(default)]
    pub specializations: Vec<TaskType>,
    /// Whether this is a light general-purpose model.
    #[serde(default)]
    pub light: bool,
}

impl ModelInfo {
    /// Creates a general-purpose model.
    #[must_use]
    pub fn new(name: impl Into<String>, quality: f64, size_b: f64) -> Self {
        Self {
            name: name.into(),
            quality,
            size_b,
            specializations: Vec::new(),
            light: false,
        }
    }

    /// Marks the model as specialized for a task type.
    #[must_use]
    pub fn specialized_for(mut self, task_type: TaskType) -> Self {
        if !self.specializations.contains(&task_type) {
            self.specializations.push(task_type);
        }
        self
    }

    /// Marks the model as light.
    #[must_use]
    pub fn light(mut self) -> Self {
        self.light = true;
        self
    }

    /// Returns true if the model is tuned for the task type.
    #[must_use]
    pub fn is_specialized(&self, task_type: TaskType) -> bool {
        self.specializations.contains(&task_type)
    }
}

/// Source of the live model list.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelInventory: Send + Sync {
    /// Lists currently reachable models.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, StageError>;
}

/// An inventory backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    models: Vec<ModelInfo>,
}

impl StaticInventory {
    /// Creates an inventory from a list of models.
    #[must_use]
    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }
}

#[async_trait]
impl ModelInventory for StaticInventory {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, StageError> {
        Ok(self.models.clone())
    }
}

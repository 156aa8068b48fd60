//! Quality-aware model selection with a fallback chain.

use super::{ModelInfo, ModelInventory, QualityThresholds, StaticInventory};
use crate::core::{Complexity, TaskType};
use crate::errors::{ConfigError, StageError};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Why a model was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Chosen model.
    pub model: String,
    /// The model's quality score.
    pub score: f64,
    /// Human-readable reason.
    pub reason: String,
    /// True when the model is below the complexity class's floor.
    pub model_too_small: bool,
    /// How far below the floor, when `model_too_small`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<f64>,
    /// The floor that applied.
    pub required_quality: f64,
}

impl ModelSelection {
    /// Returns a quality warning for under-qualified selections.
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        self.model_too_small.then(|| {
            format!(
                "Model '{}' (quality {:.2}) is below the required {:.2} for this task",
                self.model, self.score, self.required_quality
            )
        })
    }
}

/// Chooses models for stages from the live inventory.
pub struct ModelSelector {
    inventory: Arc<dyn ModelInventory>,
    thresholds: QualityThresholds,
    light_model: Option<String>,
    models: RwLock<Vec<ModelInfo>>,
    cache: DashMap<String, ModelSelection>,
    loaded: AtomicBool,
}

impl std::fmt::Debug for ModelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSelector")
            .field("thresholds", &self.thresholds)
            .field("light_model", &self.light_model)
            .field("models", &self.models.read().len())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl ModelSelector {
    /// Creates a selector over an inventory. Call [`refresh`](Self::refresh)
    /// (or let the executor do it) before the first selection.
    pub fn new(
        inventory: Arc<dyn ModelInventory>,
        thresholds: QualityThresholds,
    ) -> Result<Self, ConfigError> {
        thresholds.validate()?;
        Ok(Self {
            inventory,
            thresholds,
            light_model: None,
            models: RwLock::new(Vec::new()),
            cache: DashMap::new(),
            loaded: AtomicBool::new(false),
        })
    }

    /// Creates a selector preloaded with a fixed model list.
    pub fn with_models(
        models: Vec<ModelInfo>,
        thresholds: QualityThresholds,
    ) -> Result<Self, ConfigError> {
        let selector = Self::new(Arc::new(StaticInventory::new(models.clone())), thresholds)?;
        *selector.models.write() = models;
        selector.loaded.store(true, AtomicOrdering::SeqCst);
        Ok(selector)
    }

    /// Sets the light general-purpose model used late in the fallback chain.
    #[must_use]
    pub fn with_light_model(mut self, model: Option<String>) -> Self {
        self.light_model = model;
        self
    }

    /// Returns the thresholds.
    #[must_use]
    pub fn thresholds(&self) -> QualityThresholds {
        self.thresholds
    }

    /// Returns the names of the currently available models.
    #[must_use]
    pub fn available(&self) -> Vec<String> {
        self.models.read().iter().map(|m| m.name.clone()).collect()
    }

    /// Returns true if the model is currently available.
    #[must_use]
    pub fn is_available(&self, model: &str) -> bool {
        self.models.read().iter().any(|m| m.name == model)
    }

    /// Reloads the inventory and invalidates cached selections.
    pub async fn refresh(&self) -> Result<usize, StageError> {
        let models = self.inventory.list_models().await?;
        let count = models.len();
        *self.models.write() = models;
        self.cache.clear();
        self.loaded.store(true, AtomicOrdering::SeqCst);
        tracing::info!(models = count, "Model inventory refreshed");
        Ok(count)
    }

    /// Loads the inventory once if it has never been loaded.
    pub async fn ensure_loaded(&self) -> Result<(), StageError> {
        if !self.loaded.load(AtomicOrdering::SeqCst) {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Removes a model from the live snapshot after it proved unreachable.
    pub fn mark_unavailable(&self, model: &str) {
        let removed = {
            let mut models = self.models.write();
            let before = models.len();
            models.retain(|m| m.name != model);
            before != models.len()
        };
        // A selection computed before the removal may have been cached since.
        self.cache.clear();
        if removed {
            tracing::warn!(model = %model, "Model marked unavailable");
        }
    }

    /// Chooses a model. Returns `None` only when no model is available.
    #[must_use]
    pub fn select(
        &self,
        task_type: TaskType,
        complexity: Complexity,
        preferred: Option<&str>,
    ) -> Option<ModelSelection> {
        let key = selection_cache_key(task_type, complexity, preferred);
        let cached = self.cache.get(&key).map(|hit| hit.clone());
        match cached {
            Some(hit) if self.is_available(&hit.model) => return Some(hit),
            Some(_) => {
                self.cache.remove(&key);
            }
            None => {}
        }

        let selection = self.compute(task_type, complexity, preferred)?;
        tracing::debug!(
            model = %selection.model,
            task_type = %task_type,
            complexity = %complexity,
            reason = %selection.reason,
            too_small = selection.model_too_small,
            "Model selected"
        );
        self.cache.insert(key, selection.clone());
        Some(selection)
    }

    fn compute(
        &self,
        task_type: TaskType,
        complexity: Complexity,
        preferred: Option<&str>,
    ) -> Option<ModelSelection> {
        let required = self.thresholds.for_complexity(complexity);
        let models = self.models.read();

        if let Some(model) = preferred.and_then(|name| models.iter().find(|m| m.name == name)) {
            return Some(selection_for(model, required, "explicit preference".to_string()));
        }

        let mut eligible: Vec<&ModelInfo> = models.iter().filter(|m| m.quality >= required).collect();
        eligible.sort_by(|a, b| eligible_order(a, b, task_type));
        if let Some(chosen) = eligible.first().copied() {
            let reason = if chosen.is_specialized(task_type) {
                format!("specialized for {task_type}, meets {complexity} floor {required:.2}")
            } else {
                format!("meets {complexity} floor {required:.2}")
            };
            return Some(selection_for(chosen, required, reason));
        }

        let best = models.iter().min_by(|a, b| best_effort_order(a, b))?;
        Some(selection_for(
            best,
            required,
            format!("no model meets {complexity} floor {required:.2}; using best available"),
        ))
    }

    /// Ordered fallback candidates, excluding models already tried.
    ///
    /// Order: models specialized for the task type (best first), then the
    /// light general-purpose model(s), then every other available model.
    #[must_use]
    pub fn fallback_chain(&self, task_type: TaskType, tried: &[String]) -> Vec<String> {
        let models = self.models.read();
        let mut by_quality: Vec<&ModelInfo> = models.iter().collect();
        by_quality.sort_by(|a, b| best_effort_order(a, b));

        let specialized = by_quality.iter().filter(|m| m.is_specialized(task_type));
        let light = by_quality
            .iter()
            .filter(|m| m.light || self.light_model.as_deref() == Some(m.name.as_str()));

        let mut chain: Vec<String> = Vec::new();
        for model in specialized.chain(light).chain(by_quality.iter()) {
            if !tried.contains(&model.name) && !chain.contains(&model.name) {
                chain.push(model.name.clone());
            }
        }
        chain
    }

    /// Returns the selection for a named model, if it is available.
    #[must_use]
    pub fn selection_for_model(&self, model: &str, complexity: Complexity) -> Option<ModelSelection> {
        let required = self.thresholds.for_complexity(complexity);
        self.models
            .read()
            .iter()
            .find(|m| m.name == model)
            .map(|m| selection_for(m, required, "fallback".to_string()))
    }

    /// Returns the number of cached selections.
    #[must_use]
    pub fn cached_selections(&self) -> usize {
        self.cache.len()
    }
}

fn selection_for(model: &ModelInfo, required: f64, reason: String) -> ModelSelection {
    let too_small = model.quality < required;
    ModelSelection {
        model: model.name.clone(),
        score: model.quality,
        reason,
        model_too_small: too_small,
        shortfall: too_small.then(|| required - model.quality),
        required_quality: required,
    }
}

// Specialized first, then smallest, then higher quality, then name.
fn eligible_order(a: &ModelInfo, b: &ModelInfo, task_type: TaskType) -> Ordering {
    b.is_specialized(task_type)
        .cmp(&a.is_specialized(task_type))
        .then_with(|| a.size_b.total_cmp(&b.size_b))
        .then_with(|| b.quality.total_cmp(&a.quality))
        .then_with(|| a.name.cmp(&b.name))
}

// Higher quality first, then smaller, then name.
fn best_effort_order(a: &ModelInfo, b: &ModelInfo) -> Ordering {
    b.quality
        .total_cmp(&a.quality)
        .then_with(|| a.size_b.total_cmp(&b.size_b))
        .then_with(|| a.name.cmp(&b.name))
}

/// Deterministic cache key for a selection request.
#[must_use]
pub fn selection_cache_key(
    task_type: TaskType,
    complexity: Complexity,
    preferred: Option<&str>,
) -> String {
    let combined = format!("{task_type}:{complexity}:{}", preferred.unwrap_or(""));
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    format!("sel:{}", hex::encode(&result[..16]))
}

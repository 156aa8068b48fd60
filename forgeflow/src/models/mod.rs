//! Backend model inventory and adaptive selection.

mod inventory;
mod selector;
mod thresholds;

#[cfg(test)]
pub use inventory::MockModelInventory;
pub use inventory::{ModelInfo, ModelInventory, StaticInventory};
pub use selector::{selection_cache_key, ModelSelection, ModelSelector};
pub use thresholds::QualityThresholds;

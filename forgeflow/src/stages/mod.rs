//! Stage trait and implementations.
//!
//! Stages are the units of work of the task-to-code pipeline. The engine only
//! relies on the [`Stage`] contract: take the state, return the updated state
//! or a [`StageError`]. What a stage asks its backend is its own business.

mod bounded;
mod validators;

pub use bounded::run_bounded;
pub use validators::{Validator, ValidatorSuite};

use crate::core::WorkflowState;
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;

/// Trait for pipeline stages.
///
/// The executor selects a model before calling [`Stage::execute`] and stores
/// it in `state.model`.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage implementation.
    fn name(&self) -> &str;

    /// Executes the stage.
    async fn execute(&self, state: WorkflowState) -> Result<WorkflowState, StageError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(WorkflowState) -> Result<WorkflowState, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, state: WorkflowState) -> Result<WorkflowState, StageError> {
        (self.func)(state)
    }
}

/// An async function-based stage.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowState, StageError>> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowState, StageError>> + Send,
{
    /// Creates a new async function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowState, StageError>> + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFnStage")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(WorkflowState) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkflowState, StageError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, state: WorkflowState) -> Result<WorkflowState, StageError> {
        (self.func)(state).await
    }
}

/// A stage that returns the state untouched.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, state: WorkflowState) -> Result<WorkflowState, StageError> {
        Ok(state)
    }
}

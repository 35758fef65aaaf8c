//! Engine-wide error taxonomy.
//!
//! Leaf modules define their own error types; this enum is the boundary
//! shape the orchestrator and API work with.

use thiserror::Error;
use uuid::Uuid;

use crate::llm::ProviderError;
use crate::selector::SelectorError;
use crate::store::StoreError;
use crate::task::TaskError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input, rejected before a task starts.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Hard-stop budget policy blocked a phase start.
    #[error("budget exceeded: spent {spent_micros} of {threshold_micros} micro-dollars")]
    BudgetExceeded {
        spent_micros: u64,
        threshold_micros: u64,
    },

    /// Double approval decision, or decision on a task not awaiting one.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("task {0} not found")]
    NotFound(Uuid),

    /// Cooperative cancellation observed at a phase boundary.
    #[error("task cancelled")]
    Cancelled,

    #[error("publish failed: {0}")]
    Publish(String),
}

impl From<SelectorError> for EngineError {
    fn from(err: SelectorError) -> Self {
        EngineError::Validation(err.to_string())
    }
}

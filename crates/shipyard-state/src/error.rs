//! Error types for the Shipyard entity stores.

use shipyard_core::{CoreError, EntityKind};
use thiserror::Error;

/// Result type alias for store operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid entity: {0}")]
    Validation(#[from] CoreError),

    #[error("release target {0} not found")]
    TargetNotFound(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
}

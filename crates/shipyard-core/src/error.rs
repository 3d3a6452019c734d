//! Error types for core model validation.

use shipyard_selector::SelectorError;
use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),

    #[error("malformed release target key: {0}")]
    MalformedTargetKey(String),
}

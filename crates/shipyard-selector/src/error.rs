//! Error types for the selector language.

use thiserror::Error;

/// Result type alias for selector operations.
pub type SelectorResult<T> = Result<T, SelectorError>;

/// Errors raised while validating or evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("invalid date {value:?}: expected RFC-3339, YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS[.f]")]
    InvalidDate { value: String },

    #[error("invalid cel expression {expression:?}: {reason}")]
    InvalidCel { expression: String, reason: String },

    #[error("invalid condition: {0}")]
    Invalid(String),
}

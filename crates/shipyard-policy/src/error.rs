//! Error types for policy evaluation.

use shipyard_core::CoreError;
use shipyard_selector::SelectorError;
use thiserror::Error;

/// Result type alias for policy evaluation.
pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// The rule is malformed (bad selector, bad recurrence, bad timezone).
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// The rule could not be evaluated against this scope.
    #[error("evaluation of rule {rule_id} failed: {reason}")]
    Evaluation { rule_id: String, reason: String },

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

//! Error types for target derivation.

use shipyard_index::IndexError;
use thiserror::Error;

/// Result type alias for target derivation.
pub type TargetsResult<T> = Result<T, TargetsError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetsError {
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Derived state references data that no longer exists.
    #[error("release target graph is corrupt: {0}")]
    Fatal(String),
}

impl TargetsError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Fatal(_) | Self::Index(IndexError::Inconsistent { .. })
        )
    }
}

//! Error types for reactive index operations.

use thiserror::Error;

/// Result type alias for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The recompute was cancelled; evaluated results were discarded and
    /// their ids marked dirty again.
    #[error("recompute of {index} cancelled")]
    Cancelled { index: String },

    /// The forward and reverse match maps disagree.
    #[error("index {index} is inconsistent: {detail}")]
    Inconsistent { index: String, detail: String },
}

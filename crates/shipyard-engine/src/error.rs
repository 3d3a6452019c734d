//! Engine error types.

use shipyard_changelog::ChangelogError;
use shipyard_core::CoreError;
use shipyard_queue::QueueError;
use shipyard_state::StateError;
use shipyard_targets::TargetsError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error("target graph error: {0}")]
    Targets(#[from] TargetsError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("changelog error: {0}")]
    Changelog(#[from] ChangelogError),

    /// A variable could not be resolved for a release target.
    #[error("variables-unavailable: {0}")]
    VariablesUnavailable(String),

    #[error("internal invariant violated: {0}")]
    Fatal(String),
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl EngineError {
    /// Whether retrying the failed operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Queue(e) => e.is_transient(),
            Self::Changelog(e) => !matches!(e, ChangelogError::MalformedKey(_)),
            Self::VariablesUnavailable(_) => true,
            Self::Validation(_) | Self::State(_) | Self::Targets(_) | Self::Fatal(_) => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fatal(_) => true,
            Self::Targets(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(EngineError::Queue(QueueError::Transient("io".into())).is_retryable());
        assert!(!EngineError::Queue(QueueError::Validation("bad".into())).is_retryable());
        assert!(!EngineError::Validation("bad key".into()).is_retryable());
        assert!(EngineError::Changelog(ChangelogError::Write("disk".into())).is_retryable());
        assert!(!EngineError::Changelog(ChangelogError::MalformedKey("x".into())).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(EngineError::Fatal("corrupt".into()).is_fatal());
        assert!(EngineError::Targets(TargetsError::Fatal("missing".into())).is_fatal());
        assert!(!EngineError::Validation("bad".into()).is_fatal());
    }
}

//! Error types for the work queue and worker.

use thiserror::Error;

/// Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid worker configuration: {0}")]
    Validation(String),

    #[error("work item {item_id} is not claimed by {worker_id}")]
    ClaimNotOwned { item_id: u64, worker_id: String },

    #[error("work item not found: {0}")]
    NotFound(u64),

    #[error("transient queue failure: {0}")]
    Transient(String),

    #[error("failed to open queue: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl QueueError {
    /// Storage and I/O failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::Transaction(_)
                | Self::Table(_)
                | Self::Read(_)
                | Self::Write(_)
        )
    }
}

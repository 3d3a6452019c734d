//! Error types for changelog operations.

use thiserror::Error;

/// Result type alias for changelog operations.
pub type ChangelogResult<T> = Result<T, ChangelogError>;

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("failed to open changelog: {0}")]
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

    #[error("malformed changelog key: {0}")]
    MalformedKey(String),

    #[error("partition {partition} out of range (log has {partitions})")]
    PartitionOutOfRange { partition: u32, partitions: u32 },
}

//! shipyard-changelog: append-only log of entity mutations.
//!
//! Records are keyed `{workspaceId}:{entityType}:{entityId}` and carry the
//! JSON-serialized entity; a `None` value is a tombstone. Each workspace
//! hashes (FNV-1a) to one of a fixed number of partitions, and records are
//! totally ordered within a partition by offset.
//!
//! # Backends
//!
//! - [`MemoryChangelog`]: process-local, for tests and single-node runs
//! - [`RedbChangelog`]: persisted in [redb](https://docs.rs/redb), keyed by
//!   `(partition, offset)`
//!
//! [`ChangelogWriter`] appends entity sets and deletes; [`ChangelogReader`]
//! replays partitions in offset order, keeping the latest value per key.

pub mod error;
pub mod key;
pub mod log;
pub mod reader;
pub mod redb_log;
pub mod writer;

pub use error::{ChangelogError, ChangelogResult};
pub use key::ChangelogKey;
pub use log::{ChangelogLog, ChangelogRecord, MemoryChangelog};
pub use reader::ChangelogReader;
pub use redb_log::RedbChangelog;
pub use writer::ChangelogWriter;

//! shipyard-collections: concurrent collections shared by stores and indexes.
//!
//! [`ShardedMap`] splits a string-keyed map across a fixed number of
//! independently locked shards, so readers and writers touching different
//! keys rarely contend. Iteration snapshots one shard at a time and never
//! holds a lock while the caller runs.

pub mod fnv;
pub mod sharded;

pub use fnv::fnv1a_32;
pub use sharded::{DEFAULT_SHARD_COUNT, ShardedMap, set_shard_count, shard_count};

//! shipyard-queue: durable work queue and worker node.
//!
//! Work items are identified by `(workspace, kind, scope type, scope id)`;
//! enqueueing an identity that is already queued coalesces into the
//! existing row. Workers claim items under a time-bounded lease, keep it
//! alive with a heartbeat, and either acknowledge the item or schedule a
//! retry with exponential backoff.
//!
//! Two backends implement [`WorkQueue`]: [`MemoryWorkQueue`] and the
//! redb-backed [`RedbWorkQueue`].

pub mod error;
pub mod item;
pub mod memory;
pub mod queue;
pub mod redb_queue;
pub mod worker;

pub use error::{QueueError, QueueResult};
pub use item::{AckResult, EnqueueRequest, WorkItem};
pub use memory::MemoryWorkQueue;
pub use queue::WorkQueue;
pub use redb_queue::RedbWorkQueue;
pub use worker::{
    Outcome, Processor, Worker, WorkerConfig, WorkerEvent, WorkerHook, retry_backoff,
};

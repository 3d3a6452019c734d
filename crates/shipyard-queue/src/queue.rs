//! The work-queue contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::QueueResult;
use crate::item::{AckResult, EnqueueRequest, WorkItem};

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Inserts a row, or coalesces into the row with the same identity:
    /// minimum `not_before`, maximum `priority` and `event_ts`.
    ///
    /// A claimed row is merged into as well and keeps its claim. The merge
    /// moves `updated_at`, so the holder's [`WorkQueue::ack_success`] with
    /// the claim-time version returns `deleted: false` and the row stays
    /// queued for another pass once the claim is released.
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<WorkItem>;

    /// Claims up to `batch_size` ready rows of `kind` in priority order.
    async fn claim(
        &self,
        kind: &str,
        batch_size: usize,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>>;

    /// Fails with `ClaimNotOwned` when the claim moved or expired.
    async fn extend_lease(
        &self,
        item_id: u64,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<WorkItem>;

    /// Deletes the row if `worker_id` still owns it unchanged since the claim.
    async fn ack_success(
        &self,
        item_id: u64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> QueueResult<AckResult>;

    /// Releases the claim and defers the row by `backoff`.
    async fn retry(
        &self,
        item_id: u64,
        worker_id: &str,
        last_error: &str,
        backoff: Duration,
    ) -> QueueResult<WorkItem>;

    async fn get(&self, item_id: u64) -> QueueResult<Option<WorkItem>>;

    /// Every row of `kind`, in claim order.
    async fn list(&self, kind: &str) -> QueueResult<Vec<WorkItem>>;
}

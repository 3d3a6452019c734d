//! In-process work queue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shipyard_core::SharedClock;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::item::{self, AckResult, EnqueueRequest, WorkItem};
use crate::queue::WorkQueue;

#[derive(Debug, Default)]
struct Rows {
    next_id: u64,
    items: BTreeMap<u64, WorkItem>,
    identities: HashMap<String, u64>,
}

impl Rows {
    fn get_mut(&mut self, item_id: u64) -> QueueResult<&mut WorkItem> {
        self.items
            .get_mut(&item_id)
            .ok_or(QueueError::NotFound(item_id))
    }

    fn remove(&mut self, item_id: u64) {
        if let Some(item) = self.items.remove(&item_id) {
            self.identities.remove(&item.identity());
        }
    }
}

/// A [`WorkQueue`] guarded by a single mutex.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    rows: Mutex<Rows>,
    clock: SharedClock,
}

impl MemoryWorkQueue {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            rows: Mutex::new(Rows {
                next_id: 1,
                ..Rows::default()
            }),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    #[tracing::instrument(name = "WorkQueue.Enqueue", skip_all, fields(kind = %request.kind, scope_id = %request.scope_id))]
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<WorkItem> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        if let Some(&id) = rows.identities.get(&request.identity()) {
            let existing = rows.get_mut(id)?;
            existing.coalesce(&request, now);
            debug!(item_id = id, "coalesced enqueue");
            return Ok(existing.clone());
        }
        let id = rows.next_id;
        rows.next_id += 1;
        let item = request.into_item(id, now);
        rows.identities.insert(item.identity(), id);
        rows.items.insert(id, item.clone());
        Ok(item)
    }

    #[tracing::instrument(name = "WorkQueue.Claim", skip_all, fields(kind = %kind, batch_size = batch_size, worker_id = %worker_id))]
    async fn claim(
        &self,
        kind: &str,
        batch_size: usize,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let mut ready: Vec<&WorkItem> = rows
            .items
            .values()
            .filter(|i| i.is_claimable(kind, now))
            .collect();
        ready.sort_by(|a, b| a.claim_order(b));
        let ids: Vec<u64> = ready.into_iter().take(batch_size).map(|i| i.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let item = rows.get_mut(id)?;
            item.claim(worker_id, lease, now);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    #[tracing::instrument(name = "WorkQueue.ExtendLease", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn extend_lease(
        &self,
        item_id: u64,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<WorkItem> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let item = rows.get_mut(item_id)?;
        item.extend_lease(worker_id, lease, now)?;
        Ok(item.clone())
    }

    #[tracing::instrument(name = "WorkQueue.AckSuccess", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn ack_success(
        &self,
        item_id: u64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> QueueResult<AckResult> {
        let mut rows = self.rows.lock();
        let Some(item) = rows.items.get_mut(&item_id) else {
            return Ok(AckResult { deleted: false });
        };
        let deleted = item::ack(item, worker_id, claimed_updated_at);
        if deleted {
            rows.remove(item_id);
        }
        Ok(AckResult { deleted })
    }

    #[tracing::instrument(name = "WorkQueue.Retry", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn retry(
        &self,
        item_id: u64,
        worker_id: &str,
        last_error: &str,
        backoff: Duration,
    ) -> QueueResult<WorkItem> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let item = rows.get_mut(item_id)?;
        item.check_owner(worker_id)?;
        item.schedule_retry(last_error, backoff, now);
        Ok(item.clone())
    }

    async fn get(&self, item_id: u64) -> QueueResult<Option<WorkItem>> {
        Ok(self.rows.lock().items.get(&item_id).cloned())
    }

    async fn list(&self, kind: &str) -> QueueResult<Vec<WorkItem>> {
        let rows = self.rows.lock();
        let mut items: Vec<WorkItem> = rows
            .items
            .values()
            .filter(|i| i.kind == kind)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.claim_order(b));
        Ok(items)
    }
}

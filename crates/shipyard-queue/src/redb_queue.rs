//! redb-backed work queue.
//!
//! Rows are JSON documents keyed by monotonic id. A second table maps each
//! identity (`{workspace}/{kind}/{scope type}/{scope id}`) to its row and
//! enforces one row per identity. Every operation runs in a single write
//! transaction, which makes ownership checks and updates atomic.
//! Transactions block, so the async surface hands them to tokio's blocking
//! pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use shipyard_core::SharedClock;
use tracing::debug;

use crate::error::{QueueError, QueueResult};
use crate::item::{self, AckResult, EnqueueRequest, WorkItem};
use crate::queue::WorkQueue;

/// Convert any `Display` error into a `QueueError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| QueueError::$variant(e.to_string())
    };
}

const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("work_items");
const IDENTITIES: TableDefinition<&str, u64> = TableDefinition::new("work_identities");
const META: TableDefinition<&str, u64> = TableDefinition::new("work_meta");

const NEXT_ID: &str = "next_id";

fn decode(bytes: &[u8]) -> QueueResult<WorkItem> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn encode(item: &WorkItem) -> QueueResult<Vec<u8>> {
    serde_json::to_vec(item).map_err(map_err!(Serialize))
}

/// Reads and decodes one row from any table handle over `ITEMS`.
macro_rules! load {
    ($table:expr, $id:expr) => {
        $table
            .get($id)
            .map_err(map_err!(Read))?
            .map(|guard| decode(guard.value()))
            .transpose()
    };
}

/// Encodes and writes one row.
macro_rules! store {
    ($table:expr, $item:expr) => {{
        let bytes = encode($item)?;
        $table
            .insert($item.id, bytes.as_slice())
            .map_err(map_err!(Write))
    }};
}

/// Persistent [`WorkQueue`].
#[derive(Clone)]
pub struct RedbWorkQueue {
    db: Arc<Database>,
    clock: SharedClock,
}

impl RedbWorkQueue {
    /// Open (or create) a queue at the given path.
    pub fn open(path: &Path, clock: SharedClock) -> QueueResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let queue = Self {
            db: Arc::new(db),
            clock,
        };
        queue.ensure_tables()?;
        debug!(?path, "work queue opened");
        Ok(queue)
    }

    /// Create an ephemeral in-memory queue (for testing).
    pub fn open_in_memory(clock: SharedClock) -> QueueResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let queue = Self {
            db: Arc::new(db),
            clock,
        };
        queue.ensure_tables()?;
        Ok(queue)
    }

    fn ensure_tables(&self) -> QueueResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ITEMS).map_err(map_err!(Table))?;
        txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Runs `op` against a handle to this queue on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> QueueResult<T> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || op(&queue))
            .await
            .map_err(|e| QueueError::Transient(format!("queue operation aborted: {e}")))?
    }

    fn begin(&self) -> QueueResult<WriteTransaction> {
        self.db.begin_write().map_err(map_err!(Transaction))
    }

    /// Loads an owned row, applies `update`, and writes it back.
    fn update_owned(
        &self,
        item_id: u64,
        update: impl FnOnce(&mut WorkItem) -> QueueResult<()>,
    ) -> QueueResult<WorkItem> {
        let txn = self.begin()?;
        let item = {
            let mut items = txn.open_table(ITEMS).map_err(map_err!(Table))?;
            let mut item = load!(items, item_id)?.ok_or(QueueError::NotFound(item_id))?;
            update(&mut item)?;
            store!(items, &item)?;
            item
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(item)
    }

    fn enqueue_sync(&self, request: EnqueueRequest) -> QueueResult<WorkItem> {
        let now = self.clock.now();
        let identity = request.identity();
        let txn = self.begin()?;
        let item = {
            let mut items = txn.open_table(ITEMS).map_err(map_err!(Table))?;
            let mut identities = txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
            let existing = identities
                .get(identity.as_str())
                .map_err(map_err!(Read))?
                .map(|g| g.value());
            match existing {
                Some(id) => {
                    let mut item = load!(items, id)?.ok_or(QueueError::NotFound(id))?;
                    item.coalesce(&request, now);
                    store!(items, &item)?;
                    debug!(item_id = id, "coalesced enqueue");
                    item
                }
                None => {
                    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
                    let id = meta
                        .get(NEXT_ID)
                        .map_err(map_err!(Read))?
                        .map_or(1, |g| g.value());
                    meta.insert(NEXT_ID, id + 1).map_err(map_err!(Write))?;
                    let item = request.into_item(id, now);
                    store!(items, &item)?;
                    identities
                        .insert(identity.as_str(), id)
                        .map_err(map_err!(Write))?;
                    item
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(item)
    }

    fn claim_sync(
        &self,
        kind: &str,
        batch_size: usize,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>> {
        let now = self.clock.now();
        let txn = self.begin()?;
        let claimed = {
            let mut items = txn.open_table(ITEMS).map_err(map_err!(Table))?;
            let mut ready = Vec::new();
            for entry in items.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let item = decode(value.value())?;
                if item.is_claimable(kind, now) {
                    ready.push(item);
                }
            }
            ready.sort_by(|a, b| a.claim_order(b));
            ready.truncate(batch_size);
            for item in &mut ready {
                item.claim(worker_id, lease, now);
                store!(items, &item)?;
            }
            ready
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    fn ack_sync(
        &self,
        item_id: u64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> QueueResult<AckResult> {
        let txn = self.begin()?;
        let deleted = {
            let mut items = txn.open_table(ITEMS).map_err(map_err!(Table))?;
            let mut identities = txn.open_table(IDENTITIES).map_err(map_err!(Table))?;
            let loaded = load!(items, item_id)?;
            match loaded {
                None => false,
                Some(mut item) => {
                    let was_owned = item.claimed_by.as_deref() == Some(worker_id);
                    let deleted = item::ack(&mut item, worker_id, claimed_updated_at);
                    if deleted {
                        items.remove(item_id).map_err(map_err!(Write))?;
                        identities
                            .remove(item.identity().as_str())
                            .map_err(map_err!(Write))?;
                    } else if was_owned {
                        store!(items, &item)?;
                    }
                    deleted
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(AckResult { deleted })
    }

    fn get_sync(&self, item_id: u64) -> QueueResult<Option<WorkItem>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ITEMS).map_err(map_err!(Table))?;
        load!(table, item_id)
    }

    fn list_sync(&self, kind: &str) -> QueueResult<Vec<WorkItem>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ITEMS).map_err(map_err!(Table))?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item = decode(value.value())?;
            if item.kind == kind {
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.claim_order(b));
        Ok(items)
    }
}

#[async_trait]
impl WorkQueue for RedbWorkQueue {
    #[tracing::instrument(name = "WorkQueue.Enqueue", skip_all, fields(kind = %request.kind, scope_id = %request.scope_id))]
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<WorkItem> {
        self.blocking(move |queue| queue.enqueue_sync(request)).await
    }

    #[tracing::instrument(name = "WorkQueue.Claim", skip_all, fields(kind = %kind, batch_size = batch_size, worker_id = %worker_id))]
    async fn claim(
        &self,
        kind: &str,
        batch_size: usize,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>> {
        let (kind, worker_id) = (kind.to_string(), worker_id.to_string());
        self.blocking(move |queue| queue.claim_sync(&kind, batch_size, &worker_id, lease))
            .await
    }

    #[tracing::instrument(name = "WorkQueue.ExtendLease", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn extend_lease(
        &self,
        item_id: u64,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<WorkItem> {
        let worker_id = worker_id.to_string();
        self.blocking(move |queue| {
            let now = queue.clock.now();
            queue.update_owned(item_id, |item| item.extend_lease(&worker_id, lease, now))
        })
        .await
    }

    #[tracing::instrument(name = "WorkQueue.AckSuccess", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn ack_success(
        &self,
        item_id: u64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> QueueResult<AckResult> {
        let worker_id = worker_id.to_string();
        self.blocking(move |queue| queue.ack_sync(item_id, &worker_id, claimed_updated_at))
            .await
    }

    #[tracing::instrument(name = "WorkQueue.Retry", skip_all, fields(item_id = item_id, worker_id = %worker_id))]
    async fn retry(
        &self,
        item_id: u64,
        worker_id: &str,
        last_error: &str,
        backoff: Duration,
    ) -> QueueResult<WorkItem> {
        let (worker_id, last_error) = (worker_id.to_string(), last_error.to_string());
        self.blocking(move |queue| {
            let now = queue.clock.now();
            queue.update_owned(item_id, |item| {
                item.check_owner(&worker_id)?;
                item.schedule_retry(&last_error, backoff, now);
                Ok(())
            })
        })
        .await
    }

    async fn get(&self, item_id: u64) -> QueueResult<Option<WorkItem>> {
        self.blocking(move |queue| queue.get_sync(item_id)).await
    }

    async fn list(&self, kind: &str) -> QueueResult<Vec<WorkItem>> {
        let kind = kind.to_string();
        self.blocking(move |queue| queue.list_sync(&kind)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use shipyard_core::SystemClock;

    #[tokio::test]
    async fn waiting_on_a_writer_leaves_the_runtime_running() {
        let queue = RedbWorkQueue::open_in_memory(SystemClock::shared()).unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = std::thread::spawn({
            let db = Arc::clone(&queue.db);
            move || {
                let txn = db.begin_write().unwrap();
                locked_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(200));
                txn.abort().unwrap();
            }
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let item = queue
            .enqueue(EnqueueRequest::new("ws", "desired-release", "release-target", "a"))
            .await
            .unwrap();
        ticker.abort();
        holder.join().unwrap();

        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert_eq!(queue.get(item.id).await.unwrap(), Some(item));
    }
}

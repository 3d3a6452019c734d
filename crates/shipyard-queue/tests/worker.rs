//! Worker node behaviour against the in-memory queue on real time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::SystemClock;
use shipyard_queue::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KIND: &str = "desired-release";

fn config(worker_id: &str) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.into(),
        kind: KIND.into(),
        batch_size: 4,
        poll_interval: Duration::from_millis(5),
        lease_duration: Duration::from_millis(60),
        lease_heartbeat: Duration::from_millis(10),
        max_concurrency: 2,
        max_retry_backoff: Duration::from_millis(50),
    }
}

fn request(scope_id: &str) -> EnqueueRequest {
    EnqueueRequest::new("ws", KIND, "release-target", scope_id)
}

fn recording_hook() -> (WorkerHook, mpsc::UnboundedReceiver<WorkerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: WorkerHook = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (hook, rx)
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<WorkerEvent>,
    mut done: impl FnMut(&WorkerEvent) -> bool,
) -> WorkerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("hook channel closed");
            if done(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Delegates to an inner queue; can be told to fail lease extensions.
struct FlakyLease {
    inner: Arc<MemoryWorkQueue>,
    fail_extend: AtomicBool,
    acks: AtomicUsize,
}

#[async_trait]
impl WorkQueue for FlakyLease {
    async fn enqueue(&self, request: EnqueueRequest) -> QueueResult<WorkItem> {
        self.inner.enqueue(request).await
    }

    async fn claim(
        &self,
        kind: &str,
        batch_size: usize,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<Vec<WorkItem>> {
        self.inner.claim(kind, batch_size, worker_id, lease).await
    }

    async fn extend_lease(
        &self,
        item_id: u64,
        worker_id: &str,
        lease: Duration,
    ) -> QueueResult<WorkItem> {
        if self.fail_extend.load(Ordering::SeqCst) {
            return Err(QueueError::Transient("heartbeat severed".into()));
        }
        self.inner.extend_lease(item_id, worker_id, lease).await
    }

    async fn ack_success(
        &self,
        item_id: u64,
        worker_id: &str,
        claimed_updated_at: DateTime<Utc>,
    ) -> QueueResult<AckResult> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        self.inner
            .ack_success(item_id, worker_id, claimed_updated_at)
            .await
    }

    async fn retry(
        &self,
        item_id: u64,
        worker_id: &str,
        last_error: &str,
        backoff: Duration,
    ) -> QueueResult<WorkItem> {
        self.inner
            .retry(item_id, worker_id, last_error, backoff)
            .await
    }

    async fn get(&self, item_id: u64) -> QueueResult<Option<WorkItem>> {
        self.inner.get(item_id).await
    }

    async fn list(&self, kind: &str) -> QueueResult<Vec<WorkItem>> {
        self.inner.list(kind).await
    }
}

/// Sleeps for `delay` unless cancelled first.
struct Sleepy {
    delay: Duration,
    cancelled: AtomicBool,
}

#[async_trait]
impl Processor for Sleepy {
    async fn process(&self, cancel: CancellationToken, _item: &WorkItem) -> anyhow::Result<Outcome> {
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => Ok(Outcome::done()),
            _ = cancel.cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                anyhow::bail!("cancelled")
            }
        }
    }
}

struct Scripted {
    calls: AtomicUsize,
    result: fn(usize) -> anyhow::Result<Outcome>,
}

#[async_trait]
impl Processor for Scripted {
    async fn process(&self, _cancel: CancellationToken, _item: &WorkItem) -> anyhow::Result<Outcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.result)(call)
    }
}

/// Panics on every call.
struct Panicking;

#[async_trait]
impl Processor for Panicking {
    async fn process(&self, _cancel: CancellationToken, item: &WorkItem) -> anyhow::Result<Outcome> {
        panic!("processor blew up on {}", item.scope_id);
    }
}

#[tokio::test]
async fn lost_lease_cancels_processing_and_hands_item_over() {
    let inner = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    let queue = Arc::new(FlakyLease {
        inner: Arc::clone(&inner),
        fail_extend: AtomicBool::new(true),
        acks: AtomicUsize::new(0),
    });
    let item = queue.enqueue(request("t1")).await.unwrap();

    let processor = Arc::new(Sleepy {
        delay: Duration::from_millis(300),
        cancelled: AtomicBool::new(false),
    });
    let (hook, mut events) = recording_hook();
    let worker = Worker::new(
        config("w1"),
        queue.clone(),
        processor.clone(),
        SystemClock::shared(),
    )
    .unwrap()
    .with_hook(hook);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });

    wait_for(&mut events, |e| matches!(e, WorkerEvent::Retried { .. })).await;
    cancel.cancel();
    run.await.unwrap();

    assert!(processor.cancelled.load(Ordering::SeqCst));
    assert_eq!(queue.acks.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let claimed = inner
        .claim(KIND, 1, "w2", Duration::from_millis(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, item.id);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("w2"));
    assert_eq!(claimed[0].attempt_count, 1);
    assert!(claimed[0].last_error.is_some());
}

#[tokio::test]
async fn successful_items_are_acked_and_deleted() {
    let queue = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    for scope in ["a", "b", "c", "d", "e"] {
        queue.enqueue(request(scope)).await.unwrap();
    }
    let processor = Arc::new(Scripted {
        calls: AtomicUsize::new(0),
        result: |_| Ok(Outcome::done()),
    });
    let (hook, mut events) = recording_hook();
    let worker = Worker::new(config("w1"), queue.clone(), processor.clone(), SystemClock::shared())
        .unwrap()
        .with_hook(hook);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    for _ in 0..5 {
        let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::Processed { .. })).await;
        assert!(matches!(event, WorkerEvent::Processed { deleted: true, .. }));
    }
    cancel.cancel();
    run.await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Stopped { .. })).await;

    assert!(queue.is_empty());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn failures_are_retried_with_backoff() {
    let queue = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    let item = queue.enqueue(request("a")).await.unwrap();
    let processor = Arc::new(Scripted {
        calls: AtomicUsize::new(0),
        result: |_| anyhow::bail!("agent unavailable"),
    });
    let (hook, mut events) = recording_hook();
    let worker = Worker::new(config("w1"), queue.clone(), processor, SystemClock::shared())
        .unwrap()
        .with_hook(hook);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::Retried { .. })).await;
    cancel.cancel();
    run.await.unwrap();

    assert_eq!(
        event,
        WorkerEvent::Retried {
            item_id: item.id,
            backoff: Duration::from_millis(50),
        }
    );
    let row = queue.get(item.id).await.unwrap().unwrap();
    assert!(row.attempt_count >= 1);
    assert!(row.last_error.unwrap().contains("agent unavailable"));
}

#[tokio::test]
async fn requeue_after_defers_the_identity() {
    let queue = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    queue.enqueue(request("a")).await.unwrap();
    let processor = Arc::new(Scripted {
        calls: AtomicUsize::new(0),
        result: |_| Ok(Outcome::requeue_after(Duration::from_secs(3600))),
    });
    let (hook, mut events) = recording_hook();
    let worker = Worker::new(config("w1"), queue.clone(), processor.clone(), SystemClock::shared())
        .unwrap()
        .with_hook(hook);

    let started = Utc::now();
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Processed { .. })).await;
    // Give the task a moment to finish its follow-up enqueue.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    run.await.unwrap();

    let rows = queue.list(KIND).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].attempt_count, 0);
    assert!(rows[0].not_before >= started + chrono::Duration::minutes(59));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_processor_releases_the_lease_and_retries() {
    let inner = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    let queue = Arc::new(FlakyLease {
        inner: Arc::clone(&inner),
        fail_extend: AtomicBool::new(false),
        acks: AtomicUsize::new(0),
    });
    let item = queue.enqueue(request("t1")).await.unwrap();
    let (hook, mut events) = recording_hook();
    let worker = Worker::new(config("w1"), queue.clone(), Arc::new(Panicking), SystemClock::shared())
        .unwrap()
        .with_hook(hook);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { worker.run(cancel).await }
    });
    let event = wait_for(&mut events, |e| matches!(e, WorkerEvent::Retried { .. })).await;
    assert!(matches!(event, WorkerEvent::Retried { item_id, .. } if item_id == item.id));
    cancel.cancel();
    run.await.unwrap();
    assert_eq!(queue.acks.load(Ordering::SeqCst), 0);

    // No heartbeat may outlive the worker.
    while events.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut extended = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, WorkerEvent::LeaseExtended { .. }) {
            extended += 1;
        }
    }
    assert_eq!(extended, 0);

    let row = inner.get(item.id).await.unwrap().unwrap();
    assert!(row.attempt_count >= 1);
    assert!(row.last_error.unwrap().contains("panicked"));

    let claimed = inner
        .claim(KIND, 1, "w2", Duration::from_millis(60))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_by.as_deref(), Some("w2"));
}

#[test]
fn invalid_config_is_rejected() {
    let queue = Arc::new(MemoryWorkQueue::new(SystemClock::shared()));
    let processor = Arc::new(Scripted {
        calls: AtomicUsize::new(0),
        result: |_| Ok(Outcome::done()),
    });
    let mut cfg = config("w1");
    cfg.lease_heartbeat = Duration::from_millis(60);
    assert!(matches!(
        Worker::new(cfg, queue, processor, SystemClock::shared()),
        Err(QueueError::Validation(_))
    ));
}

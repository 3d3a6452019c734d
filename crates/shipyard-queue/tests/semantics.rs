//! Queue semantics shared by both backends, driven by a manual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use shipyard_core::ManualClock;
use shipyard_queue::*;

const KIND: &str = "desired-release";
const LEASE: Duration = Duration::from_secs(30);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn request(scope_id: &str) -> EnqueueRequest {
    EnqueueRequest::new("ws", KIND, "release-target", scope_id)
}

fn backends() -> Vec<(&'static str, Arc<dyn WorkQueue>, Arc<ManualClock>)> {
    let memory_clock = ManualClock::shared(t0());
    let memory: Arc<dyn WorkQueue> = Arc::new(MemoryWorkQueue::new(memory_clock.clone()));
    let redb_clock = ManualClock::shared(t0());
    let redb: Arc<dyn WorkQueue> =
        Arc::new(RedbWorkQueue::open_in_memory(redb_clock.clone()).unwrap());
    vec![("memory", memory, memory_clock), ("redb", redb, redb_clock)]
}

#[tokio::test]
async fn enqueue_coalesces_by_identity() {
    for (name, queue, _clock) in backends() {
        let first = queue
            .enqueue(request("a").with_not_before(t0() + chrono::Duration::seconds(60)))
            .await
            .unwrap();
        let merged = queue
            .enqueue(
                request("a")
                    .with_priority(3)
                    .with_event_ts(t0() + chrono::Duration::seconds(5))
                    .with_not_before(t0() + chrono::Duration::seconds(10)),
            )
            .await
            .unwrap();
        queue.enqueue(request("a").with_not_before(t0() + chrono::Duration::seconds(90)))
            .await
            .unwrap();

        let rows = queue.list(KIND).await.unwrap();
        assert_eq!(rows.len(), 1, "{name}");
        assert_eq!(merged.id, first.id, "{name}");
        assert_eq!(rows[0].priority, 3, "{name}");
        assert_eq!(rows[0].not_before, t0() + chrono::Duration::seconds(10), "{name}");
        assert_eq!(rows[0].event_ts, t0() + chrono::Duration::seconds(5), "{name}");
    }
}

#[tokio::test]
async fn claim_respects_not_before_and_order() {
    for (name, queue, clock) in backends() {
        queue.enqueue(request("low")).await.unwrap();
        queue
            .enqueue(request("high").with_priority(10))
            .await
            .unwrap();
        queue
            .enqueue(request("later").with_not_before(t0() + chrono::Duration::seconds(60)))
            .await
            .unwrap();
        queue
            .enqueue(EnqueueRequest::new("ws", "other-kind", "release-target", "x"))
            .await
            .unwrap();

        let claimed = queue
            .claim(KIND, 10, "w1", Duration::from_secs(3600))
            .await
            .unwrap();
        let scopes: Vec<&str> = claimed.iter().map(|i| i.scope_id.as_str()).collect();
        assert_eq!(scopes, vec!["high", "low"], "{name}");
        assert!(claimed.iter().all(|i| i.claimed_by.as_deref() == Some("w1")));

        assert!(queue.claim(KIND, 10, "w2", LEASE).await.unwrap().is_empty(), "{name}");

        clock.advance(chrono::Duration::seconds(60));
        let claimed = queue.claim(KIND, 10, "w2", LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1, "{name}");
        assert_eq!(claimed[0].scope_id, "later", "{name}");
    }
}

#[tokio::test]
async fn leases_are_owned_and_expire() {
    for (name, queue, clock) in backends() {
        let item = queue.enqueue(request("a")).await.unwrap();
        let claimed = queue.claim(KIND, 1, "w1", LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let err = queue.extend_lease(item.id, "w2", LEASE).await.unwrap_err();
        assert!(matches!(err, QueueError::ClaimNotOwned { .. }), "{name}");

        clock.advance(chrono::Duration::seconds(20));
        queue.extend_lease(item.id, "w1", LEASE).await.unwrap();
        clock.advance(chrono::Duration::seconds(20));
        assert!(queue.claim(KIND, 1, "w2", LEASE).await.unwrap().is_empty(), "{name}");

        clock.advance(chrono::Duration::seconds(11));
        let err = queue.extend_lease(item.id, "w1", LEASE).await.unwrap_err();
        assert!(matches!(err, QueueError::ClaimNotOwned { .. }), "{name}");

        let stolen = queue.claim(KIND, 1, "w2", LEASE).await.unwrap();
        assert_eq!(stolen[0].claimed_by.as_deref(), Some("w2"), "{name}");

        let ack = queue
            .ack_success(item.id, "w1", claimed[0].updated_at)
            .await
            .unwrap();
        assert!(!ack.deleted, "{name}");
        assert!(queue.get(item.id).await.unwrap().is_some(), "{name}");
    }
}

#[tokio::test]
async fn ack_deletes_only_unchanged_claims() {
    for (name, queue, _clock) in backends() {
        queue.enqueue(request("a")).await.unwrap();
        let claimed = queue.claim(KIND, 1, "w1", LEASE).await.unwrap().remove(0);

        // A taint arriving mid-processing.
        let merged = queue.enqueue(request("a").with_priority(1)).await.unwrap();
        assert_eq!(merged.id, claimed.id, "{name}");
        assert_eq!(merged.claimed_by.as_deref(), Some("w1"), "{name}");
        assert!(merged.updated_at > claimed.updated_at, "{name}");
        let ack = queue
            .ack_success(claimed.id, "w1", claimed.updated_at)
            .await
            .unwrap();
        assert!(!ack.deleted, "{name}");

        let again = queue.claim(KIND, 1, "w1", LEASE).await.unwrap().remove(0);
        assert_eq!(again.id, claimed.id, "{name}");
        let ack = queue
            .ack_success(again.id, "w1", again.updated_at)
            .await
            .unwrap();
        assert!(ack.deleted, "{name}");
        assert!(queue.list(KIND).await.unwrap().is_empty(), "{name}");

        // The identity is free again.
        let fresh = queue.enqueue(request("a")).await.unwrap();
        assert_ne!(fresh.id, claimed.id, "{name}");
    }
}

#[tokio::test]
async fn retry_defers_and_counts_attempts() {
    for (name, queue, clock) in backends() {
        let item = queue.enqueue(request("a")).await.unwrap();
        queue.claim(KIND, 1, "w1", LEASE).await.unwrap();

        let err = queue
            .retry(item.id, "w2", "nope", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::ClaimNotOwned { .. }), "{name}");

        let retried = queue
            .retry(item.id, "w1", "boom", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(retried.attempt_count, 1, "{name}");
        assert_eq!(retried.last_error.as_deref(), Some("boom"), "{name}");
        assert_eq!(retried.claimed_by, None, "{name}");
        assert_eq!(retried.not_before, t0() + chrono::Duration::seconds(5), "{name}");

        assert!(queue.claim(KIND, 1, "w1", LEASE).await.unwrap().is_empty(), "{name}");
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(queue.claim(KIND, 1, "w1", LEASE).await.unwrap().len(), 1, "{name}");
    }
}

#[tokio::test]
async fn redb_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.redb");
    let clock = ManualClock::shared(t0());
    {
        let queue = RedbWorkQueue::open(&path, clock.clone()).unwrap();
        queue.enqueue(request("a")).await.unwrap();
        queue.enqueue(request("b")).await.unwrap();
    }
    let queue = RedbWorkQueue::open(&path, clock).unwrap();
    assert_eq!(queue.list(KIND).await.unwrap().len(), 2);
    let next = queue.enqueue(request("c")).await.unwrap();
    assert_eq!(next.id, 3);
}

proptest! {
    #[test]
    fn pending_identity_has_one_row_with_extremes(
        enqueues in prop::collection::vec((-5i32..5, 0i64..600, 0i64..600), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let queue = MemoryWorkQueue::new(ManualClock::shared(t0()));
            for (priority, event_offset, delay) in &enqueues {
                queue
                    .enqueue(
                        request("a")
                            .with_priority(*priority)
                            .with_event_ts(t0() + chrono::Duration::seconds(*event_offset))
                            .with_not_before(t0() + chrono::Duration::seconds(*delay)),
                    )
                    .await
                    .unwrap();
            }
            let rows = queue.list(KIND).await.unwrap();
            prop_assert_eq!(rows.len(), 1);
            let max_priority = enqueues.iter().map(|e| e.0).max().unwrap();
            let max_event = enqueues.iter().map(|e| e.1).max().unwrap();
            let min_delay = enqueues.iter().map(|e| e.2).min().unwrap();
            prop_assert_eq!(rows[0].priority, max_priority);
            prop_assert_eq!(rows[0].event_ts, t0() + chrono::Duration::seconds(max_event));
            prop_assert_eq!(rows[0].not_before, t0() + chrono::Duration::seconds(min_delay));
            Ok(())
        })?;
    }
}

//! Work-item rows and the rules every backend applies to them.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// One queued unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: u64,
    pub workspace_id: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: String,
    pub event_ts: DateTime<Utc>,
    pub priority: i32,
    pub not_before: DateTime<Utc>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Unique identity used to coalesce enqueues.
pub fn identity_key(workspace_id: &str, kind: &str, scope_type: &str, scope_id: &str) -> String {
    format!("{workspace_id}/{kind}/{scope_type}/{scope_id}")
}

/// `now + d`, saturating on overflow.
pub(crate) fn after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl WorkItem {
    pub fn identity(&self) -> String {
        identity_key(&self.workspace_id, &self.kind, &self.scope_type, &self.scope_id)
    }

    pub fn is_claimed_at(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.claimed_until.is_some_and(|until| until >= now)
    }

    /// Ready to hand to a worker of `kind` at `now`.
    pub(crate) fn is_claimable(&self, kind: &str, now: DateTime<Utc>) -> bool {
        self.kind == kind
            && self.not_before <= now
            && self.claimed_until.is_none_or(|until| until < now)
    }

    /// Claim order: priority desc, event time asc, id asc.
    pub(crate) fn claim_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.event_ts.cmp(&other.event_ts))
            .then_with(|| self.id.cmp(&other.id))
    }

    pub(crate) fn claim(&mut self, worker_id: &str, lease: Duration, now: DateTime<Utc>) {
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_until = Some(after(now, lease));
        self.bump_version(now);
    }

    /// Moves `updated_at` strictly forward, to `now` when possible.
    fn bump_version(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at + chrono::Duration::microseconds(1));
    }

    /// Folds a later enqueue of the same identity into this row.
    pub(crate) fn coalesce(&mut self, request: &EnqueueRequest, now: DateTime<Utc>) {
        let (event_ts, not_before) = request.resolve(now);
        self.not_before = self.not_before.min(not_before);
        self.priority = self.priority.max(request.priority);
        self.event_ts = self.event_ts.max(event_ts);
        // An in-flight ack must not delete the pending work.
        self.bump_version(now);
    }

    /// Fails unless `worker_id` holds the claim.
    pub(crate) fn check_owner(&self, worker_id: &str) -> QueueResult<()> {
        if self.claimed_by.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(QueueError::ClaimNotOwned {
                item_id: self.id,
                worker_id: worker_id.to_string(),
            })
        }
    }

    pub(crate) fn extend_lease(
        &mut self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.check_owner(worker_id)?;
        if self.claimed_until.is_none_or(|until| until < now) {
            return Err(QueueError::ClaimNotOwned {
                item_id: self.id,
                worker_id: worker_id.to_string(),
            });
        }
        self.claimed_until = Some(after(now, lease));
        Ok(())
    }

    pub(crate) fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }

    pub(crate) fn schedule_retry(&mut self, last_error: &str, backoff: Duration, now: DateTime<Utc>) {
        self.release_claim();
        self.not_before = after(now, backoff);
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(last_error.to_string());
        self.bump_version(now);
    }

    /// An enqueue request that re-creates this row's identity.
    pub fn to_request(&self) -> EnqueueRequest {
        EnqueueRequest {
            workspace_id: self.workspace_id.clone(),
            kind: self.kind.clone(),
            scope_type: self.scope_type.clone(),
            scope_id: self.scope_id.clone(),
            event_ts: Some(self.event_ts),
            priority: self.priority,
            not_before: None,
        }
    }
}

/// Parameters of [`WorkQueue::enqueue`](crate::WorkQueue::enqueue).
/// Unset times default to the queue's current time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueRequest {
    pub workspace_id: String,
    pub kind: String,
    pub scope_type: String,
    pub scope_id: String,
    pub event_ts: Option<DateTime<Utc>>,
    pub priority: i32,
    pub not_before: Option<DateTime<Utc>>,
}

impl EnqueueRequest {
    pub fn new(
        workspace_id: impl Into<String>,
        kind: impl Into<String>,
        scope_type: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            kind: kind.into(),
            scope_type: scope_type.into(),
            scope_id: scope_id.into(),
            event_ts: None,
            priority: 0,
            not_before: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_event_ts(mut self, at: DateTime<Utc>) -> Self {
        self.event_ts = Some(at);
        self
    }

    pub fn with_not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    pub fn identity(&self) -> String {
        identity_key(&self.workspace_id, &self.kind, &self.scope_type, &self.scope_id)
    }

    pub(crate) fn resolve(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.event_ts.unwrap_or(now), self.not_before.unwrap_or(now))
    }

    pub(crate) fn into_item(self, id: u64, now: DateTime<Utc>) -> WorkItem {
        let (event_ts, not_before) = self.resolve(now);
        WorkItem {
            id,
            workspace_id: self.workspace_id,
            kind: self.kind,
            scope_type: self.scope_type,
            scope_id: self.scope_id,
            event_ts,
            priority: self.priority,
            not_before,
            attempt_count: 0,
            last_error: None,
            claimed_by: None,
            claimed_until: None,
            updated_at: now,
        }
    }
}

/// Result of [`WorkQueue::ack_success`](crate::WorkQueue::ack_success).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckResult {
    /// False when the row changed after the claim or is no longer owned.
    pub deleted: bool,
}

/// Acknowledgement rule shared by the backends. Returns whether the row
/// should be deleted; a stale owned row is released for re-claiming.
pub(crate) fn ack(item: &mut WorkItem, worker_id: &str, claimed_updated_at: DateTime<Utc>) -> bool {
    if item.claimed_by.as_deref() != Some(worker_id) {
        return false;
    }
    if item.updated_at == claimed_updated_at {
        return true;
    }
    item.release_claim();
    false
}

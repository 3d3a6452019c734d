//! Worker node: claims leased work items and drives a [`Processor`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shipyard_core::{SharedClock, WorkerSection};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::item::{WorkItem, after};
use crate::queue::WorkQueue;

/// Upper bound on retry backoff when none is configured.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Backoff before retrying an item that failed `attempts` times:
/// 1 s for a first failure, then `2^attempts` seconds, capped at `max`.
pub fn retry_backoff(attempts: u32, max: Option<Duration>) -> Duration {
    let max = max.unwrap_or(DEFAULT_MAX_BACKOFF);
    let backoff = if attempts == 0 {
        Duration::from_secs(1)
    } else {
        Duration::from_secs(1u64 << attempts.min(32))
    };
    backoff.min(max)
}

// ── Configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Item kind this worker claims.
    pub kind: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub lease_heartbeat: Duration,
    pub max_concurrency: usize,
    pub max_retry_backoff: Duration,
}

impl WorkerConfig {
    pub fn from_section(kind: impl Into<String>, section: &WorkerSection) -> Self {
        Self {
            worker_id: section.worker_id.clone(),
            kind: kind.into(),
            batch_size: section.batch_size,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            lease_duration: Duration::from_millis(section.lease_duration_ms),
            lease_heartbeat: Duration::from_millis(section.lease_heartbeat_ms),
            max_concurrency: section.max_concurrency,
            max_retry_backoff: Duration::from_millis(section.max_retry_backoff_ms),
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        let fail = |msg: &str| Err(QueueError::Validation(msg.to_string()));
        if self.worker_id.trim().is_empty() {
            return fail("worker id must not be empty");
        }
        if self.kind.trim().is_empty() {
            return fail("worker kind must not be empty");
        }
        if self.batch_size == 0 || self.max_concurrency == 0 {
            return fail("batch size and max concurrency must be positive");
        }
        if self.poll_interval.is_zero()
            || self.lease_duration.is_zero()
            || self.lease_heartbeat.is_zero()
            || self.max_retry_backoff.is_zero()
        {
            return fail("durations must be positive");
        }
        if self.lease_heartbeat >= self.lease_duration {
            return fail("lease heartbeat must be shorter than the lease");
        }
        Ok(())
    }
}

// ── Processor & hooks ─────────────────────────────────────────────

/// Successful processing result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    /// Re-enqueue the item's identity after this delay.
    pub requeue_after: Option<Duration>,
}

impl Outcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    /// Handles one claimed item. `cancel` fires when the lease is lost or
    /// the worker shuts down.
    async fn process(&self, cancel: CancellationToken, item: &WorkItem) -> anyhow::Result<Outcome>;
}

/// Lifecycle events reported to an optional [`WorkerHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { worker_id: String },
    Stopped { worker_id: String },
    Claimed { item_id: u64 },
    Processed { item_id: u64, deleted: bool },
    Retried { item_id: u64, backoff: Duration },
    Dropped { item_id: u64, error: String },
    LeaseExtended { item_id: u64 },
}

/// Callback invoked for every [`WorkerEvent`].
pub type WorkerHook = Arc<dyn Fn(WorkerEvent) + Send + Sync>;

// ── Worker ────────────────────────────────────────────────────────

/// State shared by the poll loop and its item tasks.
struct Shared {
    config: WorkerConfig,
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn Processor>,
    clock: SharedClock,
    hook: Option<WorkerHook>,
}

impl Shared {
    fn emit(&self, event: WorkerEvent) {
        if let Some(hook) = &self.hook {
            hook(event);
        }
    }
}

pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn Processor>,
        clock: SharedClock,
    ) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                queue,
                processor,
                clock,
                hook: None,
            }),
        })
    }

    /// Installs a lifecycle hook. Must be called before the worker runs.
    pub fn with_hook(mut self, hook: WorkerHook) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.hook = Some(hook);
        }
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    /// Polls until `cancel` fires, then drains in-flight items.
    #[tracing::instrument(name = "Worker.Run", skip_all, fields(worker_id = %self.shared.config.worker_id))]
    pub async fn run(&self, cancel: CancellationToken) {
        let shared = &self.shared;
        let config = &shared.config;
        let slots = Arc::new(Semaphore::new(config.max_concurrency));
        let mut tasks = JoinSet::new();
        shared.emit(WorkerEvent::Started {
            worker_id: config.worker_id.clone(),
        });
        info!(kind = %config.kind, "worker started");

        while !cancel.is_cancelled() {
            while tasks.try_join_next().is_some() {}

            let free = slots.available_permits().min(config.batch_size);
            if free == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tasks.join_next() => continue,
                }
            }

            let claimed = match shared
                .queue
                .claim(&config.kind, free, &config.worker_id, config.lease_duration)
                .await
            {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "claim failed");
                    Vec::new()
                }
            };

            if claimed.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => continue,
                }
            }

            for item in claimed {
                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    break;
                };
                shared.emit(WorkerEvent::Claimed { item_id: item.id });
                let shared = Arc::clone(shared);
                let task_cancel = cancel.child_token();
                tasks.spawn(async move {
                    handle_item(&shared, item, task_cancel).await;
                    drop(permit);
                });
            }
        }

        debug!(in_flight = tasks.len(), "draining worker");
        while tasks.join_next().await.is_some() {}
        shared.emit(WorkerEvent::Stopped {
            worker_id: config.worker_id.clone(),
        });
        info!("worker stopped");
    }
}

/// Extends the lease every heartbeat until `stop` fires. On failure the
/// lease is considered lost and `task_cancel` is fired.
async fn heartbeat(
    shared: Arc<Shared>,
    item_id: u64,
    task_cancel: CancellationToken,
    stop: CancellationToken,
    lease_lost: Arc<AtomicBool>,
) {
    let config = &shared.config;
    let mut ticker = tokio::time::interval(config.lease_heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {
                match shared
                    .queue
                    .extend_lease(item_id, &config.worker_id, config.lease_duration)
                    .await
                {
                    Ok(_) => shared.emit(WorkerEvent::LeaseExtended { item_id }),
                    Err(e) => {
                        warn!(item_id, error = %e, "lease lost; cancelling item");
                        lease_lost.store(true, Ordering::SeqCst);
                        task_cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}

#[tracing::instrument(name = "Worker.Process", skip_all, fields(item_id = item.id, scope_id = %item.scope_id, attempt = item.attempt_count))]
async fn handle_item(shared: &Arc<Shared>, item: WorkItem, task_cancel: CancellationToken) {
    let config = &shared.config;
    let stop = CancellationToken::new();
    let lease_lost = Arc::new(AtomicBool::new(false));
    let beat = tokio::spawn(heartbeat(
        Arc::clone(shared),
        item.id,
        task_cancel.clone(),
        stop.clone(),
        Arc::clone(&lease_lost),
    ));

    // Stops the heartbeat on every exit path, unwinding included.
    let stop_beat = stop.clone().drop_guard();

    let processing = tokio::spawn({
        let processor = Arc::clone(&shared.processor);
        let cancel = task_cancel.clone();
        let item = item.clone();
        async move { processor.process(cancel, &item).await }
    });
    let result = match processing.await {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "processor panicked");
            Err(anyhow::anyhow!("processor panicked: {e}"))
        }
    };
    drop(stop_beat);
    if let Err(e) = beat.await {
        error!(error = %e, "heartbeat task panicked");
    }

    let result = match result {
        Ok(_) if lease_lost.load(Ordering::SeqCst) => {
            Err(anyhow::anyhow!("lease lost during processing"))
        }
        other => other,
    };

    match result {
        Ok(outcome) => {
            match shared
                .queue
                .ack_success(item.id, &config.worker_id, item.updated_at)
                .await
            {
                Ok(ack) => {
                    if !ack.deleted {
                        debug!("item changed while processing; left queued");
                    }
                    shared.emit(WorkerEvent::Processed {
                        item_id: item.id,
                        deleted: ack.deleted,
                    });
                }
                Err(e) => warn!(error = %e, "ack failed"),
            }
            if let Some(delay) = outcome.requeue_after {
                let request = item
                    .to_request()
                    .with_not_before(after(shared.clock.now(), delay));
                if let Err(e) = shared.queue.enqueue(request).await {
                    error!(error = %e, "deferred requeue failed");
                }
            }
        }
        Err(err) => {
            let backoff = retry_backoff(item.attempt_count, Some(config.max_retry_backoff));
            warn!(error = %err, ?backoff, "processing failed; retrying");
            match shared
                .queue
                .retry(item.id, &config.worker_id, &format!("{err:#}"), backoff)
                .await
            {
                Ok(_) => shared.emit(WorkerEvent::Retried {
                    item_id: item.id,
                    backoff,
                }),
                Err(e) => {
                    error!(error = %e, "retry failed; dropping item");
                    shared.emit(WorkerEvent::Dropped {
                        item_id: item.id,
                        error: e.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WorkerConfig {
        WorkerConfig::from_section("desired-release", &WorkerSection::default())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0, None), Duration::from_secs(1));
        assert_eq!(retry_backoff(1, None), Duration::from_secs(2));
        assert_eq!(retry_backoff(4, None), Duration::from_secs(16));
        assert_eq!(retry_backoff(20, None), Duration::from_secs(300));
        assert_eq!(
            retry_backoff(3, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn default_section_yields_valid_config() {
        config().validate().unwrap();
    }

    #[test]
    fn heartbeat_must_be_shorter_than_lease() {
        let mut cfg = config();
        cfg.lease_heartbeat = cfg.lease_duration;
        assert!(matches!(cfg.validate(), Err(QueueError::Validation(_))));

        let mut cfg = config();
        cfg.worker_id = " ".into();
        assert!(cfg.validate().is_err());

        let mut cfg = config();
        cfg.batch_size = 0;
        assert!(cfg.validate().is_err());
    }
}

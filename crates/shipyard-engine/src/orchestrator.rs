//! The orchestrator: owns the indexes and drives them from store changes.
//!
//! Each tick drains the store's recorded changes, routes them to the
//! materializer, the policy-target index, the relationship index and the
//! memo cache, recomputes what is dirty, runs the taint processor, and
//! enqueues one coalescing reconcile item per affected release target.
//! Finally the drained changes are appended to the changelog, if any.
//!
//! A tick that fails after draining puts the changes back into the store
//! and leaves a full resync pending, so the next tick re-derives and logs
//! them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use shipyard_changelog::{ChangelogReader, ChangelogWriter};
use shipyard_core::{ChangeSet, EngineConfig, SharedClock};
use shipyard_index::Concurrency;
use shipyard_policy::{EvaluatorFactory, MemoCache, PolicyLookup};
use shipyard_queue::{EnqueueRequest, WorkQueue};
use shipyard_state::Store;
use shipyard_targets::{
    Materializer, PolicyTargetIndex, RelationshipIndex, TaintProcessor, TargetChanges,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EngineResult;
use crate::reconciler::DesiredReleaseReconciler;
use crate::variables::{StoreVariableManager, VariableManager};
use crate::{DESIRED_RELEASE_KIND, RELEASE_TARGET_SCOPE};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub changes: usize,
    pub created: usize,
    pub deleted: usize,
    pub tainted: usize,
    pub taint_all: bool,
    pub enqueued: usize,
    pub logged: usize,
    /// The indexes were found inconsistent and rebuilt.
    pub recovered: bool,
}

pub struct Orchestrator {
    workspace_id: String,
    store: Arc<Store>,
    clock: SharedClock,
    queue: Arc<dyn WorkQueue>,
    materializer: Materializer,
    policy_targets: Arc<PolicyTargetIndex>,
    relationships: Arc<RelationshipIndex>,
    taint: TaintProcessor,
    factory: EvaluatorFactory,
    changelog: Option<ChangelogWriter>,
    tick_interval: Duration,
    resync_pending: AtomicBool,
}

impl Orchestrator {
    /// Builds every index over `store` and registers what it already holds.
    pub fn new(
        config: &EngineConfig,
        store: Arc<Store>,
        queue: Arc<dyn WorkQueue>,
        clock: SharedClock,
    ) -> Self {
        let concurrency = Concurrency::from_config(config.index_concurrency);
        let policy_targets = Arc::new(PolicyTargetIndex::new(Arc::clone(&store), concurrency));
        let relationships = Arc::new(RelationshipIndex::new(Arc::clone(&store), concurrency));
        let lookup: Arc<dyn PolicyLookup> = policy_targets.clone();
        let memo = Arc::new(MemoCache::new(config.memo_capacity, Arc::clone(&clock)));
        let factory = EvaluatorFactory::new(Arc::clone(&store), Arc::clone(&clock), lookup, memo);

        let orchestrator = Self {
            workspace_id: config.workspace_id.clone(),
            materializer: Materializer::new(Arc::clone(&store), concurrency),
            taint: TaintProcessor::new(Arc::clone(&store)),
            store,
            clock,
            queue,
            policy_targets,
            relationships,
            factory,
            changelog: None,
            tick_interval: config.tick_interval(),
            resync_pending: AtomicBool::new(false),
        };
        orchestrator.materializer.rebuild();
        orchestrator.policy_targets.rebuild();
        orchestrator.relationships.rebuild();
        orchestrator
    }

    /// Append every drained change to `writer` from now on.
    pub fn with_changelog(mut self, writer: ChangelogWriter) -> Self {
        self.changelog = Some(writer);
        self
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn factory(&self) -> &EvaluatorFactory {
        &self.factory
    }

    pub fn policy_targets(&self) -> &Arc<PolicyTargetIndex> {
        &self.policy_targets
    }

    pub fn relationships(&self) -> &Arc<RelationshipIndex> {
        &self.relationships
    }

    /// A reconciler sharing this orchestrator's store, indexes and memo
    /// cache, resolving variables from the store.
    pub fn reconciler(&self) -> DesiredReleaseReconciler {
        let variables = Arc::new(StoreVariableManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.relationships),
        ));
        self.reconciler_with(variables)
    }

    pub fn reconciler_with(&self, variables: Arc<dyn VariableManager>) -> DesiredReleaseReconciler {
        DesiredReleaseReconciler::new(
            Arc::clone(&self.store),
            self.factory.clone(),
            variables,
            Arc::clone(&self.clock),
        )
    }

    /// Validate and apply an external change set to the store. The
    /// changes take effect on the indexes at the next tick.
    #[tracing::instrument(name = "Orchestrator.ApplyChangeSet", skip_all, fields(changes = changes.len()))]
    pub fn apply_changeset(&self, changes: ChangeSet) -> EngineResult<usize> {
        let applied = self.store.apply_changeset(changes.finalize())?;
        debug!(applied, "change set applied");
        Ok(applied)
    }

    /// Propagate everything recorded since the last tick.
    #[tracing::instrument(name = "Orchestrator.Tick", skip_all, fields(workspace = %self.workspace_id))]
    pub async fn tick(&self, cancel: &CancellationToken) -> EngineResult<TickSummary> {
        let changes = self.store.take_changes().finalize();
        match self.propagate(&changes, cancel).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                warn!(error = %e, changes = changes.len(), "tick aborted; changes kept for the next tick");
                self.store.restore_changes(changes);
                self.resync_pending.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn propagate(
        &self,
        changes: &ChangeSet,
        cancel: &CancellationToken,
    ) -> EngineResult<TickSummary> {
        let mut summary = TickSummary {
            changes: changes.len(),
            ..TickSummary::default()
        };

        for change in changes.iter() {
            self.materializer.on_change(change);
            self.policy_targets.on_change(change);
            self.relationships.on_change(change);
            self.factory.on_change(change.entity.kind());
        }

        let detected = if self.resync_pending.swap(false, Ordering::SeqCst) {
            debug!("previous tick aborted; resyncing");
            summary.recovered = true;
            self.recover(cancel)?
        } else {
            match self.derive(changes, cancel, &mut summary) {
                Ok(detected) => detected,
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "target graph inconsistent; rebuilding indexes");
                    summary.recovered = true;
                    self.recover(cancel)?
                }
                Err(e) => return Err(e),
            }
        };

        summary.created = detected.created.len();
        summary.deleted = detected.deleted.len();
        summary.tainted = detected.tainted.len();
        summary.enqueued = self.enqueue(&detected).await?;

        if let Some(writer) = &self.changelog
            && !changes.is_empty()
        {
            summary.logged = writer.write_changeset(&self.workspace_id, changes)?;
        }

        if summary.changes > 0 || summary.recovered {
            info!(
                changes = summary.changes,
                created = summary.created,
                deleted = summary.deleted,
                tainted = summary.tainted,
                enqueued = summary.enqueued,
                "tick complete"
            );
        }
        Ok(summary)
    }

    fn derive(
        &self,
        changes: &ChangeSet,
        cancel: &CancellationToken,
        summary: &mut TickSummary,
    ) -> EngineResult<TargetChanges> {
        let diff = self.materializer.recompute(cancel)?;
        self.materializer.check_consistency()?;
        let taint = self.taint.process(changes);
        summary.taint_all = taint.taint_all;
        let detected = self.taint.detect(&taint, diff);
        self.policy_targets.on_targets(&detected);
        self.policy_targets.recompute(cancel)?;
        self.relationships.recompute(cancel)?;
        Ok(detected)
    }

    /// Mark every index dirty, re-derive the targets and report every
    /// surviving target for reconciliation.
    fn recover(&self, cancel: &CancellationToken) -> EngineResult<TargetChanges> {
        self.materializer.dirty_all();
        self.policy_targets.dirty_all();
        self.relationships.dirty_all();
        self.factory.memo().clear();

        let diff = self.materializer.recompute(cancel)?;
        self.materializer.check_consistency()?;
        let created: BTreeSet<String> = diff.created.iter().map(|t| t.key()).collect();
        let tainted = self
            .store
            .targets_where(|t| !created.contains(&t.key()));
        let changes = TargetChanges {
            created: diff.created,
            deleted: diff.deleted,
            tainted,
        };
        self.policy_targets.on_targets(&changes);
        self.policy_targets.recompute(cancel)?;
        self.relationships.recompute(cancel)?;
        Ok(changes)
    }

    /// Rebuild every index from scratch and reconcile every target.
    #[tracing::instrument(name = "Orchestrator.Resync", skip_all)]
    pub async fn resync(&self, cancel: &CancellationToken) -> EngineResult<TickSummary> {
        let detected = self.recover(cancel)?;
        let enqueued = self.enqueue(&detected).await?;
        Ok(TickSummary {
            created: detected.created.len(),
            deleted: detected.deleted.len(),
            tainted: detected.tainted.len(),
            enqueued,
            recovered: true,
            ..TickSummary::default()
        })
    }

    /// Replace the store's contents with this workspace's changelog state
    /// and resync. Returns the number of entities loaded.
    #[tracing::instrument(name = "Orchestrator.Restore", skip_all, fields(workspace = %self.workspace_id))]
    pub async fn restore(
        &self,
        reader: &ChangelogReader,
        cancel: &CancellationToken,
    ) -> EngineResult<usize> {
        let entities = reader.load_for_workspace(&self.workspace_id)?;
        let loaded = entities.len();
        self.store.clear();
        for entity in entities.into_values() {
            self.store.load_entity(entity);
        }
        self.materializer.rebuild();
        self.policy_targets.rebuild();
        self.relationships.rebuild();
        let summary = self.resync(cancel).await?;
        info!(loaded, targets = summary.created, "store restored from changelog");
        Ok(loaded)
    }

    async fn enqueue(&self, changes: &TargetChanges) -> EngineResult<usize> {
        let now = self.clock.now();
        let mut enqueued = 0;
        for target in changes.to_reconcile() {
            let request = EnqueueRequest::new(
                &self.workspace_id,
                DESIRED_RELEASE_KIND,
                RELEASE_TARGET_SCOPE,
                target.key(),
            )
            .with_event_ts(now);
            self.queue.enqueue(request).await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Tick every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "orchestrator started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("orchestrator shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.tick_interval) => {
                    match self.tick(&cancel).await {
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => warn!(error = %e, "tick failed; retrying next interval"),
                        Err(e) => error!(error = %e, "tick failed"),
                    }
                }
            }
        }
    }
}

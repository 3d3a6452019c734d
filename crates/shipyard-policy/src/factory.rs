//! Maps policy rules to evaluators.

use std::sync::Arc;

use shipyard_core::{EntityKind, PolicyRule, Rule, SharedClock};
use shipyard_state::Store;
use tracing::trace;

use crate::evaluator::Evaluator;
use crate::evaluators::*;
use crate::lookup::PolicyLookup;
use crate::memo::{MemoCache, MemoizedEvaluator};

/// Builds evaluators over shared store, clock, policy lookup and memo cache.
#[derive(Clone)]
pub struct EvaluatorFactory {
    store: Arc<Store>,
    clock: SharedClock,
    lookup: Arc<dyn PolicyLookup>,
    memo: Arc<MemoCache>,
}

impl EvaluatorFactory {
    pub fn new(
        store: Arc<Store>,
        clock: SharedClock,
        lookup: Arc<dyn PolicyLookup>,
        memo: Arc<MemoCache>,
    ) -> Self {
        Self {
            store,
            clock,
            lookup,
            memo,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn lookup(&self) -> &Arc<dyn PolicyLookup> {
        &self.lookup
    }

    pub fn memo(&self) -> &Arc<MemoCache> {
        &self.memo
    }

    /// Drops memoized verdicts a change to `kind` may have invalidated.
    pub fn on_change(&self, kind: EntityKind) {
        self.memo.invalidate_kind(kind);
    }

    pub fn build(&self, rule: &PolicyRule) -> Arc<dyn Evaluator> {
        let id = rule.id.clone();
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        trace!(rule_id = %id, rule_type = %rule.rule.rule_type(), "building evaluator");

        match &rule.rule {
            Rule::AnyApproval { min_approvals } => {
                self.memoized(AnyApprovalEvaluator::new(id, *min_approvals, store))
            }
            Rule::VersionSelector { selector } => {
                self.memoized(VersionSelectorEvaluator::new(id, selector.clone()))
            }
            Rule::DeploymentDependency { depends_on } => {
                self.memoized(DeploymentDependencyEvaluator::new(
                    id,
                    depends_on.clone(),
                    store,
                    Arc::clone(&self.lookup),
                ))
            }
            Rule::DeploymentWindow {
                rrule,
                dtstart,
                duration_minutes,
                timezone,
                allow_window,
            } => Arc::new(DeploymentWindowEvaluator::new(
                id,
                rrule,
                *dtstart,
                *duration_minutes,
                timezone,
                *allow_window,
                clock,
            )),
            Rule::VersionCooldown { interval_seconds } => Arc::new(VersionCooldownEvaluator::new(
                id,
                *interval_seconds,
                store,
                clock,
            )),
            Rule::EnvironmentProgression {
                depends_on_environment,
                minimum_soak_time_minutes,
                maximum_age_hours,
                minimum_success_percentage,
                success_statuses,
            } => Arc::new(EnvironmentProgressionEvaluator::new(
                id,
                depends_on_environment.clone(),
                *minimum_soak_time_minutes,
                *maximum_age_hours,
                *minimum_success_percentage,
                success_statuses.clone(),
                store,
                clock,
            )),
            Rule::GradualRollout {
                rollout_type,
                time_scale_interval,
            } => Arc::new(GradualRolloutEvaluator::new(
                id,
                *rollout_type,
                *time_scale_interval,
                store,
                clock,
            )),
            Rule::Retry {
                max_retries,
                backoff_strategy,
                backoff_seconds,
                max_backoff_seconds,
                retry_on_statuses,
            } => Arc::new(RetryEvaluator::new(
                id,
                *max_retries,
                *backoff_strategy,
                *backoff_seconds,
                *max_backoff_seconds,
                retry_on_statuses.clone(),
                store,
                clock,
            )),
            Rule::Rollback {
                on_job_statuses,
                on_verification_failure,
            } => Arc::new(RollbackEvaluator::new(
                id,
                on_job_statuses.clone(),
                *on_verification_failure,
                store,
            )),
            Rule::Verification {
                metrics,
                trigger_on,
            } => Arc::new(VerificationEvaluator::new(
                id,
                metrics.clone(),
                *trigger_on,
                store,
            )),
        }
    }

    fn memoized(&self, evaluator: impl Evaluator + 'static) -> Arc<dyn Evaluator> {
        Arc::new(MemoizedEvaluator::new(
            Arc::new(evaluator),
            Arc::clone(&self.memo),
        ))
    }
}

//! Dispatch-side view of retry, rollback and verification rules.

use chrono::{DateTime, Utc};
use shipyard_core::RuleType;
use shipyard_state::RuleOutcome;

use crate::factory::EvaluatorFactory;
use crate::pipeline::run_evaluator;
use crate::scope::EvaluatorScope;

/// What a job dispatcher may do with a release.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchDecision {
    /// A new job may be created now.
    pub may_dispatch: bool,
    pub rollback_required: bool,
    pub verification_pending: bool,
    /// Earliest time a retry backoff expires.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<RuleOutcome>,
}

/// Evaluates every non-gating rule applying to a release's target.
pub struct DispatchGate {
    factory: EvaluatorFactory,
}

impl DispatchGate {
    pub fn new(factory: EvaluatorFactory) -> Self {
        Self { factory }
    }

    #[tracing::instrument(
        name = "DispatchGate.Evaluate",
        skip_all,
        fields(target = %scope.target, version_id = %scope.version.id)
    )]
    pub fn evaluate(&self, scope: &EvaluatorScope) -> DispatchDecision {
        let outcomes: Vec<RuleOutcome> = self
            .factory
            .lookup()
            .policies_for(&scope.target)
            .into_iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.rules)
            .filter(|r| !r.rule.rule_type().gates_release())
            .map(|r| run_evaluator(self.factory.build(&r).as_ref(), scope))
            .collect();

        let denied = |rule_type: RuleType| {
            outcomes
                .iter()
                .filter(move |o| o.rule_type == rule_type && !o.allowed)
        };
        let rollback_required = denied(RuleType::Rollback).next().is_some();
        let verification_pending = denied(RuleType::Verification).any(|o| {
            o.details
                .get("verificationPending")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        });
        let retry_blocked = denied(RuleType::Retry).next().is_some();
        let next_retry_at = denied(RuleType::Retry)
            .filter_map(|o| o.next_evaluation_time)
            .min();

        DispatchDecision {
            may_dispatch: !retry_blocked && !rollback_required,
            rollback_required,
            verification_pending,
            next_retry_at,
            outcomes,
        }
    }
}

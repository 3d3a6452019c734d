use std::sync::Arc;

use shipyard_core::{RuleType, SharedClock};
use shipyard_state::Store;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of, shift_seconds};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Denies while the target's latest release is younger than the interval.
pub struct VersionCooldownEvaluator {
    rule_id: String,
    interval_seconds: u64,
    store: Arc<Store>,
    clock: SharedClock,
}

impl VersionCooldownEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        interval_seconds: u64,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            interval_seconds,
            store,
            clock,
        }
    }
}

impl Evaluator for VersionCooldownEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::VersionCooldown
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::VersionCooldown)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let Some(previous) = self.store.latest_release_for_target(&scope.target) else {
            return Ok(RuleEvaluation::allow("no previous release"));
        };
        let now = self.clock.now();
        let unblocks_at =
            shift_seconds(&self.rule_id, previous.created_at, self.interval_seconds)?;
        let evaluation = if now < unblocks_at {
            RuleEvaluation::deny(format!(
                "cooldown active until {}",
                unblocks_at.to_rfc3339()
            ))
            .retry_at(unblocks_at)
        } else {
            RuleEvaluation::allow("cooldown elapsed")
        };
        Ok(evaluation
            .detail("previousReleaseId", previous.id)
            .detail("previousReleaseAt", previous.created_at.to_rfc3339())
            .detail("intervalSeconds", self.interval_seconds))
    }
}

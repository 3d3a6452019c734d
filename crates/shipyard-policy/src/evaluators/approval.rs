use std::collections::BTreeSet;
use std::sync::Arc;

use shipyard_core::{ApprovalStatus, RuleType};
use shipyard_state::Store;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Allowed once enough distinct users approved the version for the
/// environment. Waits on an external event, so never schedules a retry.
pub struct AnyApprovalEvaluator {
    rule_id: String,
    min_approvals: u32,
    store: Arc<Store>,
}

impl AnyApprovalEvaluator {
    pub fn new(rule_id: impl Into<String>, min_approvals: u32, store: Arc<Store>) -> Self {
        Self {
            rule_id: rule_id.into(),
            min_approvals,
            store,
        }
    }
}

impl Evaluator for AnyApprovalEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::AnyApproval
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::AnyApproval)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::ENVIRONMENT
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let approvers: BTreeSet<String> = self
            .store
            .approvals_for(&scope.version.id, &scope.environment.id)
            .into_iter()
            .filter(|a| a.status == ApprovalStatus::Approved)
            .map(|a| a.user_id)
            .collect();
        let count = approvers.len() as u32;
        let evaluation = if count >= self.min_approvals {
            RuleEvaluation::allow(format!(
                "{count} of {} required approvals",
                self.min_approvals
            ))
        } else {
            RuleEvaluation::deny(format!(
                "waiting for approvals: {count} of {}",
                self.min_approvals
            ))
        };
        Ok(evaluation
            .detail("approvals", count)
            .detail("minApprovals", self.min_approvals)
            .detail("approvers", approvers.into_iter().collect::<Vec<_>>()))
    }
}

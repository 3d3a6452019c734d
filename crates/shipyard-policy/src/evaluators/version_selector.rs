use shipyard_core::RuleType;
use shipyard_selector::Condition;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Allowed iff the candidate version matches the selector.
pub struct VersionSelectorEvaluator {
    rule_id: String,
    selector: Condition,
}

impl VersionSelectorEvaluator {
    pub fn new(rule_id: impl Into<String>, selector: Condition) -> Self {
        Self {
            rule_id: rule_id.into(),
            selector,
        }
    }
}

impl Evaluator for VersionSelectorEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::VersionSelector
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::VersionSelector)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let evaluation = if self.selector.matches(&scope.version)? {
            RuleEvaluation::allow("version matches selector")
        } else {
            RuleEvaluation::deny(format!(
                "version {} does not match selector",
                scope.version.tag
            ))
        };
        Ok(evaluation.detail("versionTag", scope.version.tag.clone()))
    }
}

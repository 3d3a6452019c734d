//! The evaluator contract shared by every rule kind.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::RuleType;
use shipyard_state::RuleOutcome;

use crate::error::{PolicyError, PolicyResult};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Verdict of one rule for one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub allowed: bool,
    pub reason: String,
    /// When a denial may turn into an allow without any external event.
    pub next_evaluation_time: Option<DateTime<Utc>>,
    pub details: BTreeMap<String, serde_json::Value>,
}

impl RuleEvaluation {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
            next_evaluation_time: None,
            details: BTreeMap::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            next_evaluation_time: None,
            details: BTreeMap::new(),
        }
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_evaluation_time = Some(at);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn into_outcome(self, rule_id: &str, rule_type: RuleType) -> RuleOutcome {
        RuleOutcome {
            rule_id: rule_id.to_string(),
            rule_type,
            allowed: self.allowed,
            reason: self.reason,
            next_evaluation_time: self.next_evaluation_time,
            details: self.details,
        }
    }
}

/// Evaluates one policy rule.
pub trait Evaluator: Send + Sync {
    fn rule_type(&self) -> RuleType;

    fn rule_id(&self) -> &str;

    /// Static cost hint; cheaper evaluators run first.
    fn complexity(&self) -> u8;

    /// Scope fields the verdict depends on.
    fn scope_fields(&self) -> ScopeFields;

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation>;
}

/// Static complexity per rule type.
pub fn complexity_of(rule_type: RuleType) -> u8 {
    match rule_type {
        RuleType::VersionSelector | RuleType::VersionCooldown => 1,
        RuleType::DeploymentWindow | RuleType::AnyApproval => 2,
        RuleType::DeploymentDependency | RuleType::EnvironmentProgression => 3,
        RuleType::GradualRollout => 4,
        RuleType::Retry | RuleType::Rollback | RuleType::Verification => 5,
    }
}

/// `at` shifted by `seconds`, failing the rule when the instant leaves the
/// representable range.
pub fn shift_seconds(
    rule_id: &str,
    at: DateTime<Utc>,
    seconds: u64,
) -> PolicyResult<DateTime<Utc>> {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| PolicyError::Evaluation {
            rule_id: rule_id.to_string(),
            reason: format!("{seconds}s after {} is out of range", at.to_rfc3339()),
        })
}

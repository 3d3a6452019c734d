//! Reconcile reports: why a release target has the desired version it has.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{ReleaseTarget, RuleType};

/// One rule's verdict for one candidate version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleOutcome {
    pub rule_id: String,
    pub rule_type: RuleType,
    pub allowed: bool,
    pub reason: String,
    #[serde(default)]
    pub next_evaluation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Pipeline result for one candidate version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDecision {
    pub version_id: String,
    pub allowed: bool,
    pub short_circuited: bool,
    pub rules: Vec<RuleOutcome>,
}

/// The last reconcile of a release target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub release_target: ReleaseTarget,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default)]
    pub desired_version_id: Option<String>,
    #[serde(default)]
    pub desired_release_id: Option<String>,
    #[serde(default)]
    pub next_evaluation_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decisions: Vec<VersionDecision>,
    /// Set when the reconcile could not complete, e.g. variables failed.
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl ReconcileReport {
    pub fn can_deploy(&self) -> bool {
        self.desired_version_id.is_some()
    }

    /// The first denying rule across all decisions, if any.
    pub fn first_denial(&self) -> Option<&RuleOutcome> {
        self.decisions
            .iter()
            .flat_map(|d| d.rules.iter())
            .find(|r| !r.allowed)
    }
}

//! Policies and their tagged rule variants.
//!
//! A [`Policy`] applies to every release target matched by at least one
//! of its [`PolicyTargetSelector`]s. Each [`PolicyRule`] carries exactly one
//! [`Rule`] shape; evaluators for each shape live in `shipyard-policy`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_selector::Condition;

use crate::error::{CoreError, CoreResult};
use crate::types::JobStatus;

// ── Policy ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub selectors: Vec<PolicyTargetSelector>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

fn default_true() -> bool {
    true
}

impl Policy {
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.is_empty() {
            return Err(CoreError::Validation("policy id must not be empty".into()));
        }
        for selector in &self.selectors {
            selector.validate()?;
        }
        for rule in &self.rules {
            if rule.policy_id != self.id {
                return Err(CoreError::Validation(format!(
                    "rule {} belongs to policy {}, not {}",
                    rule.id, rule.policy_id, self.id
                )));
            }
            rule.rule.validate()?;
        }
        Ok(())
    }
}

/// Targets a policy by deployment, environment and resource. Missing
/// parts match everything.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTargetSelector {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub deployment: Option<Condition>,
    #[serde(default)]
    pub environment: Option<Condition>,
    #[serde(default)]
    pub resource: Option<Condition>,
}

impl PolicyTargetSelector {
    pub fn validate(&self) -> CoreResult<()> {
        for condition in [&self.deployment, &self.environment, &self.resource]
            .into_iter()
            .flatten()
        {
            condition.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,
    pub policy_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub rule: Rule,
}

// ── Rule shapes ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RolloutType {
    #[default]
    Linear,
    Exponential,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    #[default]
    Linear,
    Exponential,
}

/// When a verification block runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum VerificationTrigger {
    #[default]
    JobSuccess,
    JobCreated,
}

/// One metric in a verification block. Providers are external; the
/// engine only stores and hands the declaration through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMetric {
    pub name: String,
    pub interval_seconds: u64,
    pub count: u32,
    #[serde(default)]
    pub success_condition: String,
    #[serde(default)]
    pub failure_limit: u32,
    #[serde(default)]
    pub provider: serde_json::Value,
}

/// Longest interval a rule may declare: ten years.
pub const MAX_RULE_INTERVAL_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// The inner rule shape of a [`PolicyRule`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Rule {
    AnyApproval {
        min_approvals: u32,
    },
    VersionSelector {
        selector: Condition,
    },
    DeploymentDependency {
        depends_on: Condition,
    },
    DeploymentWindow {
        rrule: String,
        #[serde(default)]
        dtstart: Option<DateTime<Utc>>,
        duration_minutes: u32,
        #[serde(default = "default_timezone")]
        timezone: String,
        #[serde(default = "default_true")]
        allow_window: bool,
    },
    VersionCooldown {
        interval_seconds: u64,
    },
    EnvironmentProgression {
        depends_on_environment: Condition,
        #[serde(default)]
        minimum_soak_time_minutes: Option<u32>,
        #[serde(default)]
        maximum_age_hours: Option<u32>,
        #[serde(default)]
        minimum_success_percentage: Option<f64>,
        #[serde(default = "default_success_statuses")]
        success_statuses: Vec<JobStatus>,
    },
    GradualRollout {
        #[serde(default)]
        rollout_type: RolloutType,
        time_scale_interval: u64,
    },
    Retry {
        max_retries: u32,
        #[serde(default)]
        backoff_strategy: BackoffStrategy,
        #[serde(default)]
        backoff_seconds: u64,
        #[serde(default)]
        max_backoff_seconds: Option<u64>,
        #[serde(default)]
        retry_on_statuses: Vec<JobStatus>,
    },
    Rollback {
        #[serde(default)]
        on_job_statuses: Vec<JobStatus>,
        #[serde(default)]
        on_verification_failure: bool,
    },
    Verification {
        metrics: Vec<VerificationMetric>,
        #[serde(default)]
        trigger_on: VerificationTrigger,
    },
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_success_statuses() -> Vec<JobStatus> {
    vec![JobStatus::Successful]
}

/// Discriminant of [`Rule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    AnyApproval,
    VersionSelector,
    DeploymentDependency,
    DeploymentWindow,
    VersionCooldown,
    EnvironmentProgression,
    GradualRollout,
    Retry,
    Rollback,
    Verification,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnyApproval => "any-approval",
            Self::VersionSelector => "version-selector",
            Self::DeploymentDependency => "deployment-dependency",
            Self::DeploymentWindow => "deployment-window",
            Self::VersionCooldown => "version-cooldown",
            Self::EnvironmentProgression => "environment-progression",
            Self::GradualRollout => "gradual-rollout",
            Self::Retry => "retry",
            Self::Rollback => "rollback",
            Self::Verification => "verification",
        }
    }

    /// Whether the desired-release reconciler consults this rule.
    /// Retry, rollback and verification belong to job dispatch.
    pub fn gates_release(self) -> bool {
        !matches!(self, Self::Retry | Self::Rollback | Self::Verification)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Rule {
    pub fn rule_type(&self) -> RuleType {
        match self {
            Self::AnyApproval { .. } => RuleType::AnyApproval,
            Self::VersionSelector { .. } => RuleType::VersionSelector,
            Self::DeploymentDependency { .. } => RuleType::DeploymentDependency,
            Self::DeploymentWindow { .. } => RuleType::DeploymentWindow,
            Self::VersionCooldown { .. } => RuleType::VersionCooldown,
            Self::EnvironmentProgression { .. } => RuleType::EnvironmentProgression,
            Self::GradualRollout { .. } => RuleType::GradualRollout,
            Self::Retry { .. } => RuleType::Retry,
            Self::Rollback { .. } => RuleType::Rollback,
            Self::Verification { .. } => RuleType::Verification,
        }
    }

    /// Static shape checks; runtime conditions are checked by evaluators.
    pub fn validate(&self) -> CoreResult<()> {
        let invalid = |msg: String| Err(CoreError::Validation(msg));
        let bounded = |what: &str, seconds: u64| {
            if seconds > MAX_RULE_INTERVAL_SECONDS {
                return invalid(format!(
                    "{what} of {seconds}s exceeds {MAX_RULE_INTERVAL_SECONDS}s"
                ));
            }
            Ok(())
        };
        match self {
            Self::AnyApproval { .. } => Ok(()),
            Self::VersionSelector { selector } => Ok(selector.validate()?),
            Self::DeploymentDependency { depends_on } => Ok(depends_on.validate()?),
            Self::DeploymentWindow {
                rrule,
                duration_minutes,
                timezone,
                ..
            } => {
                if rrule.trim().is_empty() {
                    return invalid("deployment window rrule must not be empty".into());
                }
                if *duration_minutes == 0 {
                    return invalid("deployment window duration must be positive".into());
                }
                bounded("deployment window duration", u64::from(*duration_minutes) * 60)?;
                if timezone.parse::<chrono_tz::Tz>().is_err() {
                    return invalid(format!("unknown timezone: {timezone}"));
                }
                Ok(())
            }
            Self::VersionCooldown { interval_seconds } => {
                bounded("version cooldown interval", *interval_seconds)
            }
            Self::EnvironmentProgression {
                depends_on_environment,
                minimum_soak_time_minutes,
                maximum_age_hours,
                minimum_success_percentage,
                ..
            } => {
                depends_on_environment.validate()?;
                if let Some(minutes) = minimum_soak_time_minutes {
                    bounded("minimum soak time", u64::from(*minutes) * 60)?;
                }
                if let Some(hours) = maximum_age_hours {
                    bounded("maximum age", u64::from(*hours) * 3600)?;
                }
                if let Some(pct) = minimum_success_percentage
                    && !(0.0..=100.0).contains(pct)
                {
                    return invalid(format!("success percentage out of range: {pct}"));
                }
                Ok(())
            }
            Self::GradualRollout {
                time_scale_interval,
                ..
            } => {
                if *time_scale_interval == 0 {
                    return invalid("gradual rollout time scale must be positive".into());
                }
                bounded("gradual rollout time scale", *time_scale_interval)
            }
            Self::Retry {
                backoff_seconds,
                max_backoff_seconds,
                ..
            } => {
                if let Some(max) = max_backoff_seconds
                    && max < backoff_seconds
                {
                    return invalid("max backoff must not be below base backoff".into());
                }
                bounded("retry backoff", *backoff_seconds)?;
                if let Some(max) = max_backoff_seconds {
                    bounded("retry max backoff", *max)?;
                }
                Ok(())
            }
            Self::Rollback { .. } => Ok(()),
            Self::Verification { metrics, .. } => {
                for metric in metrics {
                    if metric.name.is_empty() || metric.count == 0 {
                        return invalid("verification metrics need a name and count".into());
                    }
                    bounded("verification metric interval", metric.interval_seconds)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rule(json: serde_json::Value) -> PolicyRule {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn rule_is_tagged_by_type() {
        let r = rule(serde_json::json!({
            "id": "r1",
            "policyId": "p1",
            "createdAt": "2024-01-01T00:00:00Z",
            "type": "version-cooldown",
            "intervalSeconds": 3600
        }));
        assert_eq!(r.rule, Rule::VersionCooldown { interval_seconds: 3600 });
        assert_eq!(r.rule.rule_type(), RuleType::VersionCooldown);
    }

    #[test]
    fn window_defaults_to_utc_allow() {
        let r = rule(serde_json::json!({
            "id": "r1",
            "policyId": "p1",
            "createdAt": "2024-01-01T00:00:00Z",
            "type": "deployment-window",
            "rrule": "FREQ=DAILY;BYHOUR=9",
            "durationMinutes": 60
        }));
        match r.rule {
            Rule::DeploymentWindow {
                timezone,
                allow_window,
                ..
            } => {
                assert_eq!(timezone, "UTC");
                assert!(allow_window);
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let bad_tz = Rule::DeploymentWindow {
            rrule: "FREQ=DAILY".into(),
            dtstart: None,
            duration_minutes: 10,
            timezone: "Mars/Olympus".into(),
            allow_window: true,
        };
        assert!(bad_tz.validate().is_err());
        let zero_scale = Rule::GradualRollout {
            rollout_type: RolloutType::Linear,
            time_scale_interval: 0,
        };
        assert!(zero_scale.validate().is_err());
    }

    #[test]
    fn validation_bounds_intervals() {
        let cooldown = |interval_seconds| Rule::VersionCooldown { interval_seconds };
        assert!(cooldown(MAX_RULE_INTERVAL_SECONDS).validate().is_ok());
        assert!(cooldown(MAX_RULE_INTERVAL_SECONDS + 1).validate().is_err());
        assert!(cooldown(10u64.pow(16)).validate().is_err());

        let rollout = Rule::GradualRollout {
            rollout_type: RolloutType::Normal,
            time_scale_interval: u64::MAX,
        };
        assert!(rollout.validate().is_err());

        let retry = Rule::Retry {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Linear,
            backoff_seconds: 60,
            max_backoff_seconds: Some(u64::MAX),
            retry_on_statuses: vec![],
        };
        assert!(retry.validate().is_err());

        let progression = Rule::EnvironmentProgression {
            depends_on_environment: Condition::metadata_equals("tier", "staging"),
            minimum_soak_time_minutes: None,
            maximum_age_hours: Some(u32::MAX),
            minimum_success_percentage: None,
            success_statuses: vec![JobStatus::Successful],
        };
        assert!(progression.validate().is_err());
    }

    #[test]
    fn policy_rejects_foreign_rules() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let policy = Policy {
            id: "p1".into(),
            workspace_id: "ws".into(),
            name: "gate".into(),
            description: None,
            enabled: true,
            priority: 0,
            created_at,
            selectors: vec![PolicyTargetSelector::default()],
            rules: vec![PolicyRule {
                id: "r1".into(),
                policy_id: "other".into(),
                created_at,
                rule: Rule::AnyApproval { min_approvals: 1 },
            }],
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn dispatch_rules_do_not_gate_releases() {
        assert!(RuleType::AnyApproval.gates_release());
        assert!(!RuleType::Retry.gates_release());
        assert!(!RuleType::Verification.gates_release());
    }
}

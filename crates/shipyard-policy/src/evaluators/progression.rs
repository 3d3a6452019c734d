use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shipyard_core::{Environment, JobStatus, RuleType, SharedClock};
use shipyard_selector::Condition;
use shipyard_state::Store;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of};
use crate::scope::{EvaluatorScope, ScopeFields};

/// Gates a version on its track record in upstream environments.
pub struct EnvironmentProgressionEvaluator {
    rule_id: String,
    depends_on: Condition,
    minimum_soak: Option<Duration>,
    maximum_age: Option<Duration>,
    minimum_success_percentage: Option<f64>,
    success_statuses: Vec<JobStatus>,
    store: Arc<Store>,
    clock: SharedClock,
}

impl EnvironmentProgressionEvaluator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: impl Into<String>,
        depends_on: Condition,
        minimum_soak_time_minutes: Option<u32>,
        maximum_age_hours: Option<u32>,
        minimum_success_percentage: Option<f64>,
        success_statuses: Vec<JobStatus>,
        store: Arc<Store>,
        clock: SharedClock,
    ) -> Self {
        let success_statuses = if success_statuses.is_empty() {
            vec![JobStatus::Successful]
        } else {
            success_statuses
        };
        Self {
            rule_id: rule_id.into(),
            depends_on,
            minimum_soak: minimum_soak_time_minutes.map(|m| Duration::minutes(i64::from(m))),
            maximum_age: maximum_age_hours.map(|h| Duration::hours(i64::from(h))),
            minimum_success_percentage,
            success_statuses,
            store,
            clock,
        }
    }

    fn upstream_environments(&self, current: &Environment) -> PolicyResult<Vec<Environment>> {
        let mut upstream = Vec::new();
        for env in self.store.environments_in_system(&current.system_id) {
            if env.id != current.id && self.depends_on.matches(&env)? {
                upstream.push(env);
            }
        }
        upstream.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(upstream)
    }

    /// Checks one upstream environment; `None` means it is satisfied.
    fn check_environment(
        &self,
        version_id: &str,
        env: &Environment,
    ) -> Option<RuleEvaluation> {
        let now = self.clock.now();
        let jobs: Vec<_> = self
            .store
            .jobs_for_version_in_environment(version_id, &env.id)
            .into_iter()
            .map(|(_, job)| job)
            .collect();

        let mut success_times: Vec<_> = jobs
            .iter()
            .filter(|j| self.success_statuses.contains(&j.status))
            .filter_map(|j| j.finished_at())
            .collect();
        success_times.sort();
        let (Some(first), Some(latest)) = (success_times.first(), success_times.last()) else {
            return Some(
                RuleEvaluation::deny(format!(
                    "version not yet deployed successfully to environment {}",
                    env.name
                ))
                .detail("environmentId", env.id.clone()),
            );
        };

        if let Some(soak) = self.minimum_soak {
            let soaked_at = first
                .checked_add_signed(soak)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            if now < soaked_at {
                return Some(
                    RuleEvaluation::deny(format!(
                        "soaking in environment {} until {}",
                        env.name,
                        soaked_at.to_rfc3339()
                    ))
                    .retry_at(soaked_at)
                    .detail("environmentId", env.id.clone()),
                );
            }
        }

        if let Some(max_age) = self.maximum_age
            && latest.checked_add_signed(max_age).is_some_and(|limit| now > limit)
        {
            return Some(
                RuleEvaluation::deny(format!(
                    "latest success in environment {} is older than {}h",
                    env.name,
                    max_age.num_hours()
                ))
                .detail("environmentId", env.id.clone())
                .detail("latestSuccessAt", latest.to_rfc3339()),
            );
        }

        if let Some(minimum) = self.minimum_success_percentage {
            let terminal = jobs.iter().filter(|j| j.status.is_terminal()).count();
            let successful = jobs
                .iter()
                .filter(|j| j.status.is_terminal() && self.success_statuses.contains(&j.status))
                .count();
            let percentage = if terminal == 0 {
                0.0
            } else {
                successful as f64 / terminal as f64 * 100.0
            };
            if percentage < minimum {
                return Some(
                    RuleEvaluation::deny(format!(
                        "success rate {percentage:.1}% in environment {} is below {minimum:.1}%",
                        env.name
                    ))
                    .detail("environmentId", env.id.clone())
                    .detail("successPercentage", percentage),
                );
            }
        }
        None
    }
}

impl Evaluator for EnvironmentProgressionEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::EnvironmentProgression
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::EnvironmentProgression)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::VERSION | ScopeFields::ENVIRONMENT
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let upstream = self.upstream_environments(&scope.environment)?;
        if upstream.is_empty() {
            return Ok(RuleEvaluation::allow("no upstream environments match"));
        }
        for env in &upstream {
            if let Some(denial) = self.check_environment(&scope.version.id, env) {
                return Ok(denial);
            }
        }
        let ids: Vec<String> = upstream.into_iter().map(|e| e.id).collect();
        Ok(RuleEvaluation::allow("version progressed through upstream environments")
            .detail("upstreamEnvironments", ids))
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use shipyard_core::{Deployment, JobStatus, ReleaseTarget, Rule, RuleType};
use shipyard_selector::Condition;
use shipyard_state::Store;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation, complexity_of};
use crate::lookup::PolicyLookup;
use crate::scope::{EvaluatorScope, ScopeFields};

const MAX_DEPTH: usize = 64;

/// Allowed once every upstream target on the same resource has a
/// successful latest completed job.
pub struct DeploymentDependencyEvaluator {
    rule_id: String,
    depends_on: Condition,
    store: Arc<Store>,
    lookup: Arc<dyn PolicyLookup>,
}

impl DeploymentDependencyEvaluator {
    pub fn new(
        rule_id: impl Into<String>,
        depends_on: Condition,
        store: Arc<Store>,
        lookup: Arc<dyn PolicyLookup>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            depends_on,
            store,
            lookup,
        }
    }

    fn upstream_deployments(
        &self,
        selector: &Condition,
        downstream: &str,
    ) -> PolicyResult<Vec<Deployment>> {
        let mut upstream = Vec::new();
        for deployment in self.store.deployments.values() {
            if deployment.id != downstream && selector.matches(&deployment)? {
                upstream.push(deployment);
            }
        }
        upstream.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(upstream)
    }

    fn upstream_targets(&self, deployment_id: &str, resource_id: &str) -> Vec<ReleaseTarget> {
        self.store
            .targets_where(|t| t.deployment_id == deployment_id && t.resource_id == resource_id)
    }

    /// Follows dependency rules from `target`; returns the first
    /// `(deployment, environment)` pair reached twice on one path.
    fn find_cycle(
        &self,
        target: &ReleaseTarget,
        path: &mut Vec<(String, String)>,
    ) -> PolicyResult<Option<(String, String)>> {
        let node = (target.deployment_id.clone(), target.environment_id.clone());
        if path.contains(&node) {
            return Ok(Some(node));
        }
        if path.len() >= MAX_DEPTH {
            return Ok(None);
        }
        path.push(node);

        let selectors: Vec<Condition> = self
            .lookup
            .policies_for(target)
            .into_iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.rules)
            .filter_map(|r| match r.rule {
                Rule::DeploymentDependency { depends_on } => Some(depends_on),
                _ => None,
            })
            .collect();

        let mut seen = BTreeSet::new();
        for selector in selectors {
            for upstream in self.upstream_deployments(&selector, &target.deployment_id)? {
                for next in self.upstream_targets(&upstream.id, &target.resource_id) {
                    if !seen.insert(next.key()) {
                        continue;
                    }
                    if let Some(repeat) = self.find_cycle(&next, path)? {
                        return Ok(Some(repeat));
                    }
                }
            }
        }

        path.pop();
        Ok(None)
    }
}

impl Evaluator for DeploymentDependencyEvaluator {
    fn rule_type(&self) -> RuleType {
        RuleType::DeploymentDependency
    }

    fn rule_id(&self) -> &str {
        &self.rule_id
    }

    fn complexity(&self) -> u8 {
        complexity_of(RuleType::DeploymentDependency)
    }

    fn scope_fields(&self) -> ScopeFields {
        ScopeFields::RELEASE_TARGET
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let target = &scope.target;
        let upstream = self.upstream_deployments(&self.depends_on, &target.deployment_id)?;
        if upstream.is_empty() {
            return Ok(RuleEvaluation::allow("no upstream deployments match"));
        }

        let mut path = Vec::new();
        if let Some((deployment, environment)) = self.find_cycle(target, &mut path)? {
            return Ok(RuleEvaluation::deny("cycle-detected")
                .detail("cycleDeployment", deployment)
                .detail("cycleEnvironment", environment));
        }

        let mut satisfied = Vec::new();
        for deployment in &upstream {
            let targets = self.upstream_targets(&deployment.id, &target.resource_id);
            if targets.is_empty() {
                return Ok(RuleEvaluation::deny(format!(
                    "no successful release of upstream deployment {} on resource {}",
                    deployment.name, target.resource_id
                ))
                .detail("upstreamDeployment", deployment.id.clone()));
            }
            for upstream_target in targets {
                let latest = self.store.latest_completed_job(&upstream_target);
                if latest.as_ref().map(|j| j.status) != Some(JobStatus::Successful) {
                    let mut denial = RuleEvaluation::deny(format!(
                        "no successful release of upstream deployment {} on {}",
                        deployment.name,
                        upstream_target.key()
                    ))
                    .detail("upstreamTarget", upstream_target.key());
                    if let Some(job) = latest {
                        denial = denial
                            .detail("latestJobId", job.id)
                            .detail("latestJobStatus", serde_json::to_value(job.status).unwrap_or_default());
                    }
                    return Ok(denial);
                }
                satisfied.push(upstream_target.key());
            }
        }

        Ok(RuleEvaluation::allow("all upstream deployments succeeded")
            .detail("upstreamTargets", satisfied))
    }
}

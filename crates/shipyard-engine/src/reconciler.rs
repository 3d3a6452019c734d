//! Desired-release reconciler: picks the version a release target should
//! run and records why.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::{
    Deployment, DeploymentVersion, Entity, Environment, Release, ReleaseTarget, Resource,
    SharedClock,
};
use shipyard_policy::{EvaluatorFactory, EvaluatorScope, Pipeline};
use shipyard_queue::{Outcome, Processor, WorkItem};
use shipyard_state::{ReconcileReport, Store, VersionDecision};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, info, warn};

use crate::RELEASE_TARGET_SCOPE;
use crate::error::{EngineError, EngineResult};
use crate::variables::{ResolvedVariables, VariableManager};

/// Result of reconciling one release target.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// The target no longer exists; nothing to do.
    Gone,
    Evaluated(ReconcileReport),
}

impl Reconciliation {
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::Gone => None,
            Self::Evaluated(report) => Some(report),
        }
    }

    pub fn next_evaluation_time(&self) -> Option<DateTime<Utc>> {
        self.report().and_then(|r| r.next_evaluation_time)
    }

    pub fn desired_version_id(&self) -> Option<&str> {
        self.report().and_then(|r| r.desired_version_id.as_deref())
    }
}

#[derive(Clone)]
pub struct DesiredReleaseReconciler {
    store: Arc<Store>,
    factory: EvaluatorFactory,
    variables: Arc<dyn VariableManager>,
    clock: SharedClock,
}

impl DesiredReleaseReconciler {
    pub fn new(
        store: Arc<Store>,
        factory: EvaluatorFactory,
        variables: Arc<dyn VariableManager>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            factory,
            variables,
            clock,
        }
    }

    /// Evaluate every candidate version of the target newest first and
    /// make the first fully allowed one the desired release. The report is
    /// stored whatever the outcome.
    #[tracing::instrument(
        name = "Reconciler.Reconcile",
        skip_all,
        fields(target = %target_key, decision.can_deploy = field::Empty)
    )]
    pub fn reconcile(&self, target_key: &str) -> EngineResult<Reconciliation> {
        let target = ReleaseTarget::parse_key(target_key)?;
        let Some((deployment, environment, resource)) = self.load_entities(&target) else {
            debug!("release target gone");
            return Ok(Reconciliation::Gone);
        };
        let now = self.clock.now();
        let mut report = ReconcileReport {
            release_target: target.clone(),
            evaluated_at: now,
            desired_version_id: None,
            desired_release_id: None,
            next_evaluation_time: None,
            decisions: Vec::new(),
            blocked_reason: None,
        };

        let versions = self.store.candidate_versions(&target.deployment_id);
        if versions.is_empty() {
            debug!("no candidate versions");
            return Ok(self.finish(report));
        }

        let policies = self.factory.lookup().policies_for(&target);
        let pipeline = Pipeline::build(&policies, &self.factory);
        debug!(
            versions = versions.len(),
            policies = policies.len(),
            rules = pipeline.len(),
            "evaluating candidates"
        );

        let mut chosen: Option<DeploymentVersion> = None;
        let mut next: Option<DateTime<Utc>> = None;
        for version in versions {
            let scope = EvaluatorScope {
                target: target.clone(),
                deployment: deployment.clone(),
                environment: environment.clone(),
                resource: resource.clone(),
                version,
            };
            let decision = pipeline.evaluate(&scope);
            let allowed = decision.allowed;
            report.decisions.push(VersionDecision {
                version_id: scope.version.id.clone(),
                allowed,
                short_circuited: decision.short_circuited,
                rules: decision.outcomes,
            });
            if allowed {
                chosen = Some(scope.version);
                break;
            }
            if let Some(at) = decision.next_evaluation_time {
                next = Some(next.map_or(at, |n| n.min(at)));
            }
        }

        let Some(version) = chosen else {
            report.next_evaluation_time = next;
            return Ok(self.finish(report));
        };

        match self.variables.resolve(&target) {
            Ok(variables) => {
                let release = self.persist(&target, &version, variables, now)?;
                report.desired_version_id = Some(version.id);
                report.desired_release_id = Some(release.id);
            }
            Err(EngineError::VariablesUnavailable(reason)) => {
                warn!(version_id = %version.id, %reason, "variables unavailable; release withheld");
                report.blocked_reason = Some(format!("variables-unavailable: {reason}"));
            }
            Err(e) => return Err(e),
        }
        Ok(self.finish(report))
    }

    fn load_entities(&self, target: &ReleaseTarget) -> Option<(Deployment, Environment, Resource)> {
        self.store.release_target(&target.key())?;
        Some((
            self.store.deployments.get(&target.deployment_id)?,
            self.store.environments.get(&target.environment_id)?,
            self.store.resources.get(&target.resource_id)?,
        ))
    }

    /// Releases are immutable: an existing release for the pair is reused.
    fn persist(
        &self,
        target: &ReleaseTarget,
        version: &DeploymentVersion,
        variables: ResolvedVariables,
        now: DateTime<Utc>,
    ) -> EngineResult<Release> {
        let id = Release::derive_id(target, &version.id);
        let release = match self.store.releases.get(&id) {
            Some(existing) => existing,
            None => {
                let release = Release::new(
                    target.clone(),
                    version.id.clone(),
                    variables.values,
                    variables.encrypted,
                    now,
                );
                self.store.upsert_entity(Entity::Release(release.clone()))?;
                info!(release_id = %release.id, version = %version.tag, "release created");
                release
            }
        };
        self.store.set_desired_release(target, &release.id);
        Ok(release)
    }

    fn finish(&self, report: ReconcileReport) -> Reconciliation {
        tracing::Span::current().record("decision.can_deploy", report.can_deploy());
        self.store.set_report(report.clone());
        Reconciliation::Evaluated(report)
    }
}

#[async_trait]
impl Processor for DesiredReleaseReconciler {
    #[tracing::instrument(
        name = "Reconciler.Process",
        skip_all,
        fields(item_id = item.id, target = %item.scope_id)
    )]
    async fn process(&self, cancel: CancellationToken, item: &WorkItem) -> anyhow::Result<Outcome> {
        if cancel.is_cancelled() {
            anyhow::bail!("reconcile of {} cancelled", item.scope_id);
        }
        if item.scope_type != RELEASE_TARGET_SCOPE {
            warn!(scope_type = %item.scope_type, "unexpected scope type; dropping item");
            return Ok(Outcome::done());
        }
        let reconciler = self.clone();
        let key = item.scope_id.clone();
        let span = Span::current();
        let reconciled =
            tokio::task::spawn_blocking(move || span.in_scope(|| reconciler.reconcile(&key)))
                .await
                .map_err(|e| anyhow::anyhow!("reconcile of {} aborted: {e}", item.scope_id))?;
        match reconciled {
            Ok(reconciliation) => Ok(match reconciliation.next_evaluation_time() {
                Some(at) => {
                    let delay = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
                    debug!(?delay, "deferring re-evaluation");
                    Outcome::requeue_after(delay)
                }
                None => Outcome::done(),
            }),
            Err(e) if e.is_retryable() => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "reconcile failed permanently; dropping item");
                Ok(Outcome::done())
            }
        }
    }
}

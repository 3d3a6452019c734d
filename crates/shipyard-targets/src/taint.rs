//! Taint propagation from entity changes to release targets.

use std::collections::BTreeSet;
use std::sync::Arc;

use shipyard_core::{ChangeSet, Entity, ReleaseTarget};
use shipyard_state::Store;
use tracing::debug;

use crate::materializer::TargetDiff;

/// Targets a change set affects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaintResult {
    /// Keys of tainted targets.
    pub tainted: BTreeSet<String>,
    /// Number of changes classified before the walk stopped.
    pub visited: usize,
    /// A change forced every target to be re-evaluated.
    pub taint_all: bool,
}

/// Everything the orchestrator must act on after a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChanges {
    pub created: Vec<ReleaseTarget>,
    pub deleted: Vec<ReleaseTarget>,
    /// Existing targets needing re-evaluation, excluding created ones.
    pub tainted: Vec<ReleaseTarget>,
}

impl TargetChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.tainted.is_empty()
    }

    /// Targets to reconcile: created plus tainted.
    pub fn to_reconcile(&self) -> impl Iterator<Item = &ReleaseTarget> {
        self.created.iter().chain(self.tainted.iter())
    }
}

pub struct TaintProcessor {
    store: Arc<Store>,
}

enum Scope {
    All,
    Deployment(String),
    Environment(String),
    Resource(String),
    Target(ReleaseTarget),
    None,
}

impl TaintProcessor {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Walk `changes` once and collect the tainted target keys. A policy,
    /// system or relationship-rule change taints everything and ends the
    /// walk.
    #[tracing::instrument(name = "TaintProcessor.Process", skip_all, fields(changes = changes.len()))]
    pub fn process(&self, changes: &ChangeSet) -> TaintResult {
        let mut result = TaintResult::default();
        for change in changes.iter() {
            result.visited += 1;
            match self.classify(&change.entity) {
                Scope::All => {
                    result.taint_all = true;
                    result.tainted = self.store.release_target_keys().into_iter().collect();
                    break;
                }
                Scope::Deployment(id) => {
                    result
                        .tainted
                        .extend(self.store.targets_for_deployment(&id).iter().map(ReleaseTarget::key));
                }
                Scope::Environment(id) => {
                    result
                        .tainted
                        .extend(self.store.targets_for_environment(&id).iter().map(ReleaseTarget::key));
                }
                Scope::Resource(id) => {
                    result
                        .tainted
                        .extend(self.store.targets_for_resource(&id).iter().map(ReleaseTarget::key));
                }
                Scope::Target(target) => {
                    let key = target.key();
                    if self.store.has_release_target(&key) {
                        result.tainted.insert(key);
                    }
                }
                Scope::None => {}
            }
        }
        debug!(
            tainted = result.tainted.len(),
            visited = result.visited,
            taint_all = result.taint_all,
            "taint pass complete"
        );
        result
    }

    fn classify(&self, entity: &Entity) -> Scope {
        match entity {
            Entity::Policy(_) | Entity::System(_) | Entity::RelationshipRule(_) => Scope::All,
            Entity::Environment(e) => Scope::Environment(e.id.clone()),
            Entity::Deployment(d) => Scope::Deployment(d.id.clone()),
            Entity::DeploymentVersion(v) => Scope::Deployment(v.deployment_id.clone()),
            Entity::DeploymentVariable(v) => Scope::Deployment(v.deployment_id.clone()),
            Entity::DeploymentVariableValue(value) => self
                .store
                .deployment_variables
                .get(&value.variable_id)
                .map_or(Scope::None, |v| Scope::Deployment(v.deployment_id)),
            Entity::Resource(r) => Scope::Resource(r.id.clone()),
            Entity::ResourceVariable(v) => Scope::Resource(v.resource_id.clone()),
            Entity::UserApprovalRecord(a) => Scope::Environment(a.environment_id.clone()),
            Entity::Job(job) => self
                .store
                .target_for_job(job)
                .map_or(Scope::None, Scope::Target),
            Entity::Workspace(_) | Entity::Release(_) => Scope::None,
        }
    }

    /// Combine a taint pass with a materializer diff. Deleted targets are
    /// dropped from the tainted set; created ones are reported once.
    pub fn detect(&self, taint: &TaintResult, diff: TargetDiff) -> TargetChanges {
        let created_keys: BTreeSet<String> = diff.created.iter().map(ReleaseTarget::key).collect();
        let deleted_keys: BTreeSet<String> = diff.deleted.iter().map(ReleaseTarget::key).collect();
        let tainted = taint
            .tainted
            .iter()
            .filter(|key| !created_keys.contains(*key) && !deleted_keys.contains(*key))
            .filter_map(|key| self.store.release_target(key))
            .collect();
        TargetChanges {
            created: diff.created,
            deleted: diff.deleted,
            tainted,
        }
    }
}

//! Release-target materialization.
//!
//! A target `(d, e, r)` exists iff `d` and `e` share a system, `e`'s
//! resource selector matches `r` and `d`'s resource selector matches `r`.
//! An environment without a selector matches no resources; a deployment
//! without one matches every resource. Soft-deleted resources match
//! nothing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use shipyard_core::{Change, ChangeKind, Entity, ReleaseTarget};
use shipyard_index::{Concurrency, MatchIndex};
use shipyard_selector::Condition;
use shipyard_state::Store;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{TargetsError, TargetsResult};

/// Targets created and deleted by one recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDiff {
    pub created: Vec<ReleaseTarget>,
    pub deleted: Vec<ReleaseTarget>,
}

impl TargetDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

pub struct Materializer {
    store: Arc<Store>,
    /// resources × environments
    environments: MatchIndex,
    /// resources × deployments
    deployments: MatchIndex,
    /// Set when the pairing of deployments and environments may have changed.
    topology_dirty: AtomicBool,
}

impl Materializer {
    pub fn new(store: Arc<Store>, concurrency: Concurrency) -> Self {
        let env_store = Arc::clone(&store);
        let environments = MatchIndex::new(
            "environment-resources",
            Arc::new(move |resource_id: &str, environment_id: &str| {
                let (Some(resource), Some(environment)) = (
                    env_store.resources.get(resource_id),
                    env_store.environments.get(environment_id),
                ) else {
                    return Ok(false);
                };
                if resource.is_deleted() {
                    return Ok(false);
                }
                match &environment.resource_selector {
                    Some(selector) => Ok(selector.matches(&resource)?),
                    None => Ok(false),
                }
            }),
        )
        .with_concurrency(concurrency);

        let dep_store = Arc::clone(&store);
        let deployments = MatchIndex::new(
            "deployment-resources",
            Arc::new(move |resource_id: &str, deployment_id: &str| {
                let (Some(resource), Some(deployment)) = (
                    dep_store.resources.get(resource_id),
                    dep_store.deployments.get(deployment_id),
                ) else {
                    return Ok(false);
                };
                if resource.is_deleted() {
                    return Ok(false);
                }
                Ok(Condition::matches_optional(
                    deployment.resource_selector.as_ref(),
                    &resource,
                )?)
            }),
        )
        .with_concurrency(concurrency);

        Self {
            store,
            environments,
            deployments,
            topology_dirty: AtomicBool::new(true),
        }
    }

    /// Register every resource, environment and deployment in the store.
    pub fn rebuild(&self) {
        for id in self.store.resources.ids() {
            self.environments.add_entity(&id);
            self.deployments.add_entity(&id);
        }
        for id in self.store.environments.ids() {
            self.environments.add_selector(&id);
        }
        for id in self.store.deployments.ids() {
            self.deployments.add_selector(&id);
        }
        self.topology_dirty.store(true, Ordering::SeqCst);
    }

    pub fn dirty_all(&self) {
        self.environments.dirty_all();
        self.deployments.dirty_all();
        self.topology_dirty.store(true, Ordering::SeqCst);
    }

    /// Route one entity change to the indexes.
    pub fn on_change(&self, change: &Change) {
        let removed = change.kind == ChangeKind::Delete;
        match &change.entity {
            Entity::Resource(resource) => {
                if removed {
                    self.environments.remove_entity(&resource.id);
                    self.deployments.remove_entity(&resource.id);
                } else {
                    self.environments.add_entity(&resource.id);
                    self.deployments.add_entity(&resource.id);
                }
            }
            Entity::Environment(environment) => {
                if removed {
                    self.environments.remove_selector(&environment.id);
                } else {
                    self.environments.add_selector(&environment.id);
                }
            }
            Entity::Deployment(deployment) => {
                if removed {
                    self.deployments.remove_selector(&deployment.id);
                } else {
                    self.deployments.add_selector(&deployment.id);
                }
            }
            Entity::System(_) => {}
            _ => return,
        }
        self.topology_dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.topology_dirty.load(Ordering::SeqCst)
            || self.environments.is_dirty()
            || self.deployments.is_dirty()
    }

    /// Recompute both indexes and reconcile the store's target table.
    #[tracing::instrument(name = "Materializer.Recompute", skip_all)]
    pub fn recompute(&self, cancel: &CancellationToken) -> TargetsResult<TargetDiff> {
        let evaluated =
            self.environments.recompute(cancel)? + self.deployments.recompute(cancel)?;
        let topology_changed = self.topology_dirty.swap(false, Ordering::SeqCst);
        if evaluated == 0 && !topology_changed {
            return Ok(TargetDiff::default());
        }

        let desired = self.derive_targets();
        let existing: BTreeSet<String> = self.store.release_target_keys().into_iter().collect();

        let mut diff = TargetDiff::default();
        for (key, target) in &desired {
            if !existing.contains(key) && self.store.set_release_target(target.clone()) {
                diff.created.push(target.clone());
            }
        }
        for key in existing {
            if !desired.contains_key(&key)
                && let Some(target) = self.store.remove_release_target(&key)
            {
                diff.deleted.push(target);
            }
        }
        diff.created.sort();
        diff.deleted.sort();

        if !diff.is_empty() {
            info!(
                created = diff.created.len(),
                deleted = diff.deleted.len(),
                total = self.store.release_target_count(),
                "release targets changed"
            );
        }
        debug!(evaluated, "materializer recompute complete");
        Ok(diff)
    }

    fn derive_targets(&self) -> HashMap<String, ReleaseTarget> {
        let mut targets = HashMap::new();
        for environment in self.store.environments.values() {
            let resources = self.environments.get_matches(&environment.id);
            if resources.is_empty() {
                continue;
            }
            for deployment in self.store.deployments_in_system(&environment.system_id) {
                for resource_id in &resources {
                    if self.deployments.is_match(resource_id, &deployment.id) {
                        let target =
                            ReleaseTarget::new(&deployment.id, &environment.id, resource_id);
                        targets.insert(target.key(), target);
                    }
                }
            }
        }
        targets
    }

    /// Every stored target must reference live entities sharing a system,
    /// and both indexes must be internally consistent.
    pub fn check_consistency(&self) -> TargetsResult<()> {
        self.environments.check_consistency()?;
        self.deployments.check_consistency()?;
        for target in self.store.release_targets() {
            let deployment = self.store.deployments.get(&target.deployment_id);
            let environment = self.store.environments.get(&target.environment_id);
            let resource = self.store.resources.get(&target.resource_id);
            match (deployment, environment, resource) {
                (Some(d), Some(e), Some(_)) if d.system_id == e.system_id => {}
                _ => {
                    return Err(TargetsError::Fatal(format!(
                        "target {target} references missing or mismatched entities"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Resources matched by an environment's selector.
    pub fn resources_in_environment(&self, environment_id: &str) -> Vec<String> {
        self.environments.get_matches(environment_id)
    }

    /// Resources matched by a deployment's selector.
    pub fn resources_for_deployment(&self, deployment_id: &str) -> Vec<String> {
        self.deployments.get_matches(deployment_id)
    }
}

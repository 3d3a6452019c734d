//! Which policies apply to which release targets.
//!
//! A policy applies to a target when any of its target selectors matches
//! the target's deployment, environment and resource. A selector part that
//! is absent matches everything; a policy with no selectors applies to
//! nothing.

use std::sync::Arc;

use shipyard_core::{Change, ChangeKind, Entity, Policy, ReleaseTarget};
use shipyard_index::{Concurrency, MatchIndex};
use shipyard_selector::Condition;
use shipyard_state::Store;
use tokio_util::sync::CancellationToken;

use crate::error::TargetsResult;
use crate::taint::TargetChanges;

fn policy_applies(store: &Store, target_key: &str, policy_id: &str) -> anyhow::Result<bool> {
    let Some(policy) = store.policies.get(policy_id) else {
        return Ok(false);
    };
    let target = ReleaseTarget::parse_key(target_key)?;
    let (Some(deployment), Some(environment), Some(resource)) = (
        store.deployments.get(&target.deployment_id),
        store.environments.get(&target.environment_id),
        store.resources.get(&target.resource_id),
    ) else {
        return Ok(false);
    };
    for selector in &policy.selectors {
        if Condition::matches_optional(selector.deployment.as_ref(), &deployment)?
            && Condition::matches_optional(selector.environment.as_ref(), &environment)?
            && Condition::matches_optional(selector.resource.as_ref(), &resource)?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

pub struct PolicyTargetIndex {
    store: Arc<Store>,
    index: MatchIndex,
}

impl PolicyTargetIndex {
    pub fn new(store: Arc<Store>, concurrency: Concurrency) -> Self {
        let match_store = Arc::clone(&store);
        let index = MatchIndex::new(
            "policy-targets",
            Arc::new(move |target_key: &str, policy_id: &str| {
                policy_applies(&match_store, target_key, policy_id)
            }),
        )
        .with_concurrency(concurrency);
        Self { store, index }
    }

    pub fn rebuild(&self) {
        for key in self.store.release_target_keys() {
            self.index.add_entity(&key);
        }
        for id in self.store.policies.ids() {
            self.index.add_selector(&id);
        }
    }

    pub fn dirty_all(&self) {
        self.index.dirty_all();
    }

    /// Track policy changes and dirty targets whose entities changed.
    pub fn on_change(&self, change: &Change) {
        let removed = change.kind == ChangeKind::Delete;
        let targets = match &change.entity {
            Entity::Policy(policy) => {
                if removed {
                    self.index.remove_selector(&policy.id);
                } else {
                    self.index.add_selector(&policy.id);
                }
                return;
            }
            Entity::Deployment(d) => self.store.targets_for_deployment(&d.id),
            Entity::Environment(e) => self.store.targets_for_environment(&e.id),
            Entity::Resource(r) => self.store.targets_for_resource(&r.id),
            _ => return,
        };
        for target in targets {
            self.index.dirty_entity(&target.key());
        }
    }

    /// Track target creation and deletion.
    pub fn on_targets(&self, changes: &TargetChanges) {
        for target in &changes.created {
            self.index.add_entity(&target.key());
        }
        for target in &changes.deleted {
            self.index.remove_entity(&target.key());
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.index.is_dirty()
    }

    #[tracing::instrument(name = "PolicyTargetIndex.Recompute", skip_all)]
    pub fn recompute(&self, cancel: &CancellationToken) -> TargetsResult<usize> {
        Ok(self.index.recompute(cancel)?)
    }

    /// Policies applying to a target, highest priority first.
    pub fn policies_for(&self, target: &ReleaseTarget) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self
            .index
            .get_matching_selectors(&target.key())
            .iter()
            .filter_map(|id| self.store.policies.get(id))
            .collect();
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        policies
    }

    /// Target keys a policy applies to.
    pub fn targets_for(&self, policy_id: &str) -> Vec<String> {
        self.index.get_matches(policy_id)
    }

    pub fn check_consistency(&self) -> TargetsResult<()> {
        Ok(self.index.check_consistency()?)
    }
}

//! The bundle of all entity repositories plus derived tables.

use std::collections::BTreeMap;

use shipyard_collections::ShardedMap;
use shipyard_core::*;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::report::ReconcileReport;
use crate::repository::{ChangeRecorder, Repository, StoredEntity};

/// Dispatch an [`Entity`] to the repository of its kind.
macro_rules! dispatch_entity {
    ($store:expr, $entity:expr, |$repo:ident, $e:ident| $body:expr) => {
        match $entity {
            Entity::Workspace($e) => { let $repo = &$store.workspaces; $body }
            Entity::System($e) => { let $repo = &$store.systems; $body }
            Entity::Resource($e) => { let $repo = &$store.resources; $body }
            Entity::Deployment($e) => { let $repo = &$store.deployments; $body }
            Entity::DeploymentVersion($e) => { let $repo = &$store.versions; $body }
            Entity::Environment($e) => { let $repo = &$store.environments; $body }
            Entity::Policy($e) => { let $repo = &$store.policies; $body }
            Entity::Release($e) => { let $repo = &$store.releases; $body }
            Entity::Job($e) => { let $repo = &$store.jobs; $body }
            Entity::UserApprovalRecord($e) => { let $repo = &$store.approvals; $body }
            Entity::RelationshipRule($e) => { let $repo = &$store.relationship_rules; $body }
            Entity::DeploymentVariable($e) => { let $repo = &$store.deployment_variables; $body }
            Entity::DeploymentVariableValue($e) => { let $repo = &$store.deployment_variable_values; $body }
            Entity::ResourceVariable($e) => { let $repo = &$store.resource_variables; $body }
        }
    };
}

/// Dispatch an [`EntityKind`] to its repository, mapping values into [`Entity`].
macro_rules! dispatch_kind {
    ($store:expr, $kind:expr, |$repo:ident, $wrap:ident| $body:expr) => {
        match $kind {
            EntityKind::Workspace => { let $repo = &$store.workspaces; let $wrap = Entity::Workspace; $body }
            EntityKind::System => { let $repo = &$store.systems; let $wrap = Entity::System; $body }
            EntityKind::Resource => { let $repo = &$store.resources; let $wrap = Entity::Resource; $body }
            EntityKind::Deployment => { let $repo = &$store.deployments; let $wrap = Entity::Deployment; $body }
            EntityKind::DeploymentVersion => { let $repo = &$store.versions; let $wrap = Entity::DeploymentVersion; $body }
            EntityKind::Environment => { let $repo = &$store.environments; let $wrap = Entity::Environment; $body }
            EntityKind::Policy => { let $repo = &$store.policies; let $wrap = Entity::Policy; $body }
            EntityKind::Release => { let $repo = &$store.releases; let $wrap = Entity::Release; $body }
            EntityKind::Job => { let $repo = &$store.jobs; let $wrap = Entity::Job; $body }
            EntityKind::UserApprovalRecord => { let $repo = &$store.approvals; let $wrap = Entity::UserApprovalRecord; $body }
            EntityKind::RelationshipRule => { let $repo = &$store.relationship_rules; let $wrap = Entity::RelationshipRule; $body }
            EntityKind::DeploymentVariable => { let $repo = &$store.deployment_variables; let $wrap = Entity::DeploymentVariable; $body }
            EntityKind::DeploymentVariableValue => { let $repo = &$store.deployment_variable_values; let $wrap = Entity::DeploymentVariableValue; $body }
            EntityKind::ResourceVariable => { let $repo = &$store.resource_variables; let $wrap = Entity::ResourceVariable; $body }
        }
    };
}

/// Every entity repository of one workspace, plus derived tables.
#[derive(Debug)]
pub struct Store {
    recorder: ChangeRecorder,

    pub workspaces: Repository<Workspace>,
    pub systems: Repository<System>,
    pub resources: Repository<Resource>,
    pub deployments: Repository<Deployment>,
    pub versions: Repository<DeploymentVersion>,
    pub environments: Repository<Environment>,
    pub policies: Repository<Policy>,
    pub releases: Repository<Release>,
    pub jobs: Repository<Job>,
    pub approvals: Repository<UserApprovalRecord>,
    pub relationship_rules: Repository<RelationshipRule>,
    pub deployment_variables: Repository<DeploymentVariable>,
    pub deployment_variable_values: Repository<DeploymentVariableValue>,
    pub resource_variables: Repository<ResourceVariable>,

    /// Materialized release targets keyed by target key.
    release_targets: ShardedMap<ReleaseTarget>,
    /// Target key -> id of the desired release.
    desired_releases: ShardedMap<String>,
    /// Target key -> last reconcile report.
    reports: ShardedMap<ReconcileReport>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let recorder = ChangeRecorder::default();
        Self {
            workspaces: Repository::new(recorder.clone()),
            systems: Repository::new(recorder.clone()),
            resources: Repository::new(recorder.clone()),
            deployments: Repository::new(recorder.clone()),
            versions: Repository::new(recorder.clone()),
            environments: Repository::new(recorder.clone()),
            policies: Repository::new(recorder.clone()),
            releases: Repository::new(recorder.clone()),
            jobs: Repository::new(recorder.clone()),
            approvals: Repository::new(recorder.clone()),
            relationship_rules: Repository::new(recorder.clone()),
            deployment_variables: Repository::new(recorder.clone()),
            deployment_variable_values: Repository::new(recorder.clone()),
            resource_variables: Repository::new(recorder.clone()),
            recorder,
            release_targets: ShardedMap::new(),
            desired_releases: ShardedMap::new(),
            reports: ShardedMap::new(),
        }
    }

    /// Drain the changes recorded since the last call.
    pub fn take_changes(&self) -> ChangeSet {
        self.recorder.take()
    }

    /// Return changes taken with [`Store::take_changes`] that could not be
    /// propagated. They are drained again, first, by the next call.
    pub fn restore_changes(&self, changes: ChangeSet) {
        self.recorder.restore(changes);
    }

    pub fn pending_changes(&self) -> usize {
        self.recorder.pending()
    }

    // ── Generic entity access ─────────────────────────────────────

    pub fn upsert_entity(&self, entity: Entity) -> StateResult<Option<Entity>> {
        entity.validate()?;
        let prior =
            dispatch_entity!(self, entity, |repo, e| repo.upsert(e).map(StoredEntity::into_entity));
        Ok(prior)
    }

    pub fn delete_entity(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        dispatch_kind!(self, kind, |repo, wrap| repo.delete(id).map(wrap))
    }

    pub fn taint_entity(&self, kind: EntityKind, id: &str) -> bool {
        dispatch_kind!(self, kind, |repo, _wrap| repo.taint(id))
    }

    pub fn get_entity(&self, kind: EntityKind, id: &str) -> Option<Entity> {
        dispatch_kind!(self, kind, |repo, wrap| repo.get(id).map(wrap))
    }

    /// Insert without recording a change.
    pub fn load_entity(&self, entity: Entity) {
        dispatch_entity!(self, entity, |repo, e| repo.load(e))
    }

    /// Every stored entity of `kind`.
    pub fn entities_of(&self, kind: EntityKind) -> Vec<Entity> {
        dispatch_kind!(self, kind, |repo, wrap| repo
            .values()
            .into_iter()
            .map(wrap)
            .collect())
    }

    pub fn count_of(&self, kind: EntityKind) -> usize {
        dispatch_kind!(self, kind, |repo, _wrap| repo.count())
    }

    pub fn counts(&self) -> BTreeMap<EntityKind, usize> {
        EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, self.count_of(kind)))
            .collect()
    }

    /// Apply one external change. Deletes and taints of unknown ids are
    /// ignored.
    pub fn apply(&self, change: Change) -> StateResult<()> {
        let (kind, id) = change.key();
        match change.kind {
            ChangeKind::Create | ChangeKind::Update => {
                self.upsert_entity(change.entity)?;
            }
            ChangeKind::Delete => {
                if self.delete_entity(kind, &id).is_none() {
                    debug!(%kind, %id, "delete of unknown entity ignored");
                }
            }
            ChangeKind::Taint => {
                self.taint_entity(kind, &id);
            }
        }
        Ok(())
    }

    /// Validate every change, then apply them in order. Nothing is applied
    /// when any change is invalid.
    pub fn apply_changeset(&self, changes: ChangeSet) -> StateResult<usize> {
        for change in changes.iter() {
            if matches!(change.kind, ChangeKind::Create | ChangeKind::Update) {
                change.entity.validate()?;
            }
        }
        let applied = changes.len();
        for change in changes {
            self.apply(change)?;
        }
        Ok(applied)
    }

    /// Drop every entity and derived row.
    pub fn clear(&self) {
        for kind in EntityKind::ALL {
            dispatch_kind!(self, kind, |repo, _wrap| repo.clear());
        }
        self.release_targets.clear();
        self.desired_releases.clear();
        self.reports.clear();
        self.recorder.take();
    }

    // ── Derived tables ────────────────────────────────────────────

    pub fn set_release_target(&self, target: ReleaseTarget) -> bool {
        self.release_targets.set_if_absent(target.key(), target)
    }

    pub fn remove_release_target(&self, key: &str) -> Option<ReleaseTarget> {
        self.desired_releases.remove(key);
        self.reports.remove(key);
        self.release_targets.pop(key)
    }

    pub fn release_target(&self, key: &str) -> Option<ReleaseTarget> {
        self.release_targets.get(key)
    }

    pub fn has_release_target(&self, key: &str) -> bool {
        self.release_targets.has(key)
    }

    pub fn release_targets(&self) -> Vec<ReleaseTarget> {
        self.release_targets.values()
    }

    pub fn release_target_keys(&self) -> Vec<String> {
        self.release_targets.keys()
    }

    pub fn release_target_count(&self) -> usize {
        self.release_targets.count()
    }

    pub fn set_desired_release(&self, target: &ReleaseTarget, release_id: &str) {
        self.desired_releases.set(target.key(), release_id.to_string());
    }

    pub fn clear_desired_release(&self, target: &ReleaseTarget) {
        self.desired_releases.remove(&target.key());
    }

    /// The release currently desired for a target, if any.
    pub fn desired_release(&self, target_key: &str) -> Option<Release> {
        let release_id = self.desired_releases.get(target_key)?;
        self.releases.get(&release_id)
    }

    pub fn set_report(&self, report: ReconcileReport) {
        self.reports.set(report.release_target.key(), report);
    }

    pub fn report(&self, target_key: &str) -> Option<ReconcileReport> {
        self.reports.get(target_key)
    }

    /// Target key lookup that reports a typed not-found.
    pub fn require_target(&self, key: &str) -> StateResult<ReleaseTarget> {
        self.release_target(key)
            .ok_or_else(|| StateError::TargetNotFound(key.to_string()))
    }
}

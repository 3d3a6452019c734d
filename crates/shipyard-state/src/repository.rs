//! Per-kind entity repository.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use shipyard_collections::ShardedMap;
use shipyard_core::*;

/// Buffer of changes shared by every repository of a store.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecorder {
    inner: Arc<Mutex<ChangeSet>>,
}

impl ChangeRecorder {
    pub fn record(&self, kind: ChangeKind, entity: Entity) {
        self.inner.lock().record(kind, entity);
    }

    /// Drain everything recorded so far, coalesced per entity key.
    pub fn take(&self) -> ChangeSet {
        std::mem::take(&mut *self.inner.lock()).finalize()
    }

    /// Put drained changes back ahead of anything recorded since.
    pub fn restore(&self, mut drained: ChangeSet) {
        let mut inner = self.inner.lock();
        drained.extend(std::mem::take(&mut *inner));
        *inner = drained;
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().len()
    }
}

/// An entity type a [`Repository`] can hold.
pub trait StoredEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn store_key(&self) -> String;

    fn into_entity(self) -> Entity;
}

macro_rules! stored_entity {
    ($ty:ident, $kind:ident, |$e:ident| $key:expr) => {
        impl StoredEntity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn store_key(&self) -> String {
                let $e = self;
                $key
            }

            fn into_entity(self) -> Entity {
                Entity::$kind(self)
            }
        }
    };
}

stored_entity!(Workspace, Workspace, |e| e.id.clone());
stored_entity!(System, System, |e| e.id.clone());
stored_entity!(Resource, Resource, |e| e.id.clone());
stored_entity!(Deployment, Deployment, |e| e.id.clone());
stored_entity!(DeploymentVersion, DeploymentVersion, |e| e.id.clone());
stored_entity!(Environment, Environment, |e| e.id.clone());
stored_entity!(Policy, Policy, |e| e.id.clone());
stored_entity!(Release, Release, |e| e.id.clone());
stored_entity!(Job, Job, |e| e.id.clone());
stored_entity!(UserApprovalRecord, UserApprovalRecord, |e| e.key());
stored_entity!(RelationshipRule, RelationshipRule, |e| e.id.clone());
stored_entity!(DeploymentVariable, DeploymentVariable, |e| e.id.clone());
stored_entity!(DeploymentVariableValue, DeploymentVariableValue, |e| e.id.clone());
stored_entity!(ResourceVariable, ResourceVariable, |e| e.id.clone());

/// Entities of one kind, keyed by id.
#[derive(Debug)]
pub struct Repository<T: Clone> {
    items: ShardedMap<T>,
    recorder: ChangeRecorder,
}

impl<T: StoredEntity> Repository<T> {
    pub fn new(recorder: ChangeRecorder) -> Self {
        Self {
            items: ShardedMap::new(),
            recorder,
        }
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    /// Insert or replace, returning the prior value.
    pub fn upsert(&self, entity: T) -> Option<T> {
        let key = entity.store_key();
        let mut prior = None;
        self.items.upsert_with(
            key,
            entity.clone(),
            |_, current, new| {
                prior = current.cloned();
                new
            },
            |_| (),
        );
        let kind = if prior.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Create
        };
        self.recorder.record(kind, entity.into_entity());
        prior
    }

    /// Remove by id, returning the removed value.
    pub fn delete(&self, id: &str) -> Option<T> {
        let removed = self.items.pop(id)?;
        self.recorder
            .record(ChangeKind::Delete, removed.clone().into_entity());
        Some(removed)
    }

    /// Record a taint for an existing entity without changing it.
    pub fn taint(&self, id: &str) -> bool {
        match self.items.get(id) {
            Some(entity) => {
                self.recorder.record(ChangeKind::Taint, entity.into_entity());
                true
            }
            None => false,
        }
    }

    /// Insert without recording a change (rebuilds).
    pub fn load(&self, entity: T) {
        self.items.set(entity.store_key(), entity);
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.items.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.items.has(id)
    }

    pub fn items(&self) -> HashMap<String, T> {
        self.items.items()
    }

    pub fn values(&self) -> Vec<T> {
        self.items.values()
    }

    /// Values for which `keep` returns true.
    pub fn filter(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        self.items.iter().filter(|(_, v)| keep(v)).map(|(_, v)| v).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.keys()
    }

    pub fn count(&self) -> usize {
        self.items.count()
    }

    pub fn clear(&self) {
        self.items.clear();
    }
}

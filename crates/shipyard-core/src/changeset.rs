//! Buffered entity mutations.
//!
//! A [`ChangeSet`] collects the [`Change`]s emitted during one logical
//! transaction. [`ChangeSet::finalize`] coalesces repeated changes to the
//! same entity so downstream consumers see one change per key, in the
//! order each key was first touched.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Entity, EntityKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    /// Forces re-evaluation without a data change.
    Taint,
}

impl ChangeKind {
    /// Combine an earlier change with a later one to the same key.
    fn merge(self, later: ChangeKind) -> ChangeKind {
        use ChangeKind::*;
        match (self, later) {
            (Create, Update | Taint) => Create,
            (Delete, Create | Update) => Update,
            (Delete, Taint) => Delete,
            (earlier, Taint) => earlier,
            (_, later) => later,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub entity: Entity,
}

impl Change {
    pub fn new(kind: ChangeKind, entity: Entity) -> Self {
        Self { kind, entity }
    }

    pub fn key(&self) -> (EntityKind, String) {
        self.entity.compaction_key()
    }
}

/// An ordered batch of entity changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ChangeKind, entity: Entity) {
        self.changes.push(Change::new(kind, entity));
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Whether any change touches an entity of `kind`.
    pub fn contains_kind(&self, kind: EntityKind) -> bool {
        self.changes.iter().any(|c| c.entity.kind() == kind)
    }

    /// Deduplicate by entity key. The surviving change carries the latest
    /// entity state and the merged change kind.
    pub fn finalize(self) -> ChangeSet {
        let mut order: Vec<(EntityKind, String)> = Vec::new();
        let mut merged: HashMap<(EntityKind, String), Change> = HashMap::new();

        for change in self.changes {
            let key = change.key();
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.kind = existing.kind.merge(change.kind);
                    if change.kind != ChangeKind::Taint {
                        existing.entity = change.entity;
                    }
                }
                None => {
                    order.push(key.clone());
                    merged.insert(key, change);
                }
            }
        }

        let changes = order
            .into_iter()
            .filter_map(|key| merged.remove(&key))
            .collect();
        ChangeSet { changes }
    }
}

impl IntoIterator for ChangeSet {
    type Item = Change;
    type IntoIter = std::vec::IntoIter<Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{System, Workspace};

    fn system(name: &str) -> Entity {
        Entity::System(System {
            id: "sys".into(),
            workspace_id: "ws".into(),
            name: name.into(),
            slug: name.into(),
        })
    }

    fn workspace() -> Entity {
        Entity::Workspace(Workspace {
            id: "ws".into(),
            name: "ws".into(),
            slug: "ws".into(),
        })
    }

    #[test]
    fn finalize_keeps_first_touch_order() {
        let mut cs = ChangeSet::new();
        cs.record(ChangeKind::Create, system("a"));
        cs.record(ChangeKind::Create, workspace());
        cs.record(ChangeKind::Update, system("b"));
        let out = cs.finalize();
        assert_eq!(out.len(), 2);
        assert_eq!(out.changes[0].kind, ChangeKind::Create);
        assert_eq!(out.changes[0].entity, system("b"));
        assert_eq!(out.changes[1].entity.kind(), EntityKind::Workspace);
    }

    #[test]
    fn delete_then_create_becomes_update() {
        let mut cs = ChangeSet::new();
        cs.record(ChangeKind::Delete, system("a"));
        cs.record(ChangeKind::Create, system("b"));
        let out = cs.finalize();
        assert_eq!(out.changes[0].kind, ChangeKind::Update);
    }

    #[test]
    fn taint_does_not_downgrade_or_replace() {
        let mut cs = ChangeSet::new();
        cs.record(ChangeKind::Delete, system("a"));
        cs.record(ChangeKind::Taint, system("stale"));
        let out = cs.finalize();
        assert_eq!(out.changes[0].kind, ChangeKind::Delete);
        assert_eq!(out.changes[0].entity, system("a"));
    }

    #[test]
    fn create_then_delete_is_delete() {
        let mut cs = ChangeSet::new();
        cs.record(ChangeKind::Create, system("a"));
        cs.record(ChangeKind::Delete, system("a"));
        assert_eq!(cs.finalize().changes[0].kind, ChangeKind::Delete);
    }
}

//! Rule-driven relationships between resources, deployments and environments.
//!
//! Each [`RelationshipRule`] gets its own match index whose selector side
//! holds `from` candidates and whose entity side holds `to` candidates,
//! both as kind-qualified ids (`resource/r1`). When both sides are the same
//! kind an entity never relates to itself. A `from` or `to` that cannot be
//! resolved is no match.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use shipyard_core::{Change, ChangeKind, Entity, RelatableKind, RelationshipRule};
use shipyard_index::{Concurrency, MatchIndex};
use shipyard_selector::{CelBindings, Condition, Selectable};
use shipyard_state::Store;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TargetsResult;

/// Which end of an edge the queried entity sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The queried entity is `from`; the related entity is `to`.
    Outgoing,
    /// The queried entity is `to`; the related entity is `from`.
    Incoming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelatedEntity {
    pub rule_id: String,
    pub reference: String,
    pub direction: Direction,
    pub kind: RelatableKind,
    pub id: String,
}

fn qualify(kind: RelatableKind, id: &str) -> String {
    let prefix = match kind {
        RelatableKind::Resource => "resource",
        RelatableKind::Deployment => "deployment",
        RelatableKind::Environment => "environment",
    };
    format!("{prefix}/{id}")
}

fn unqualify(qualified: &str) -> Option<(RelatableKind, &str)> {
    let (prefix, id) = qualified.split_once('/')?;
    let kind = match prefix {
        "resource" => RelatableKind::Resource,
        "deployment" => RelatableKind::Deployment,
        "environment" => RelatableKind::Environment,
        _ => return None,
    };
    Some((kind, id))
}

/// A resolved relatable entity with its selector view.
enum Relatable {
    Resource(shipyard_core::Resource),
    Deployment(shipyard_core::Deployment),
    Environment(shipyard_core::Environment),
}

impl Relatable {
    fn load(store: &Store, kind: RelatableKind, id: &str) -> Option<Self> {
        match kind {
            RelatableKind::Resource => store
                .resources
                .get(id)
                .filter(|r| !r.is_deleted())
                .map(Self::Resource),
            RelatableKind::Deployment => store.deployments.get(id).map(Self::Deployment),
            RelatableKind::Environment => store.environments.get(id).map(Self::Environment),
        }
    }

    fn selectable(&self) -> &dyn Selectable {
        match self {
            Self::Resource(r) => r,
            Self::Deployment(d) => d,
            Self::Environment(e) => e,
        }
    }
}

fn relatable_kind(entity: &Entity) -> Option<(RelatableKind, String)> {
    match entity {
        Entity::Resource(r) => Some((RelatableKind::Resource, r.id.clone())),
        Entity::Deployment(d) => Some((RelatableKind::Deployment, d.id.clone())),
        Entity::Environment(e) => Some((RelatableKind::Environment, e.id.clone())),
        _ => None,
    }
}

fn ids_of(store: &Store, kind: RelatableKind) -> Vec<String> {
    match kind {
        RelatableKind::Resource => store.resources.ids(),
        RelatableKind::Deployment => store.deployments.ids(),
        RelatableKind::Environment => store.environments.ids(),
    }
}

/// Decide one `from -> to` edge for `rule_id`.
fn edge_matches(store: &Store, rule_id: &str, to: &str, from: &str) -> anyhow::Result<bool> {
    let Some(rule) = store.relationship_rules.get(rule_id) else {
        return Ok(false);
    };
    let (Some((from_kind, from_id)), Some((to_kind, to_id))) = (unqualify(from), unqualify(to))
    else {
        return Ok(false);
    };
    if from_kind != rule.from_kind || to_kind != rule.to_kind {
        return Ok(false);
    }
    let (Some(from), Some(to)) = (
        Relatable::load(store, from_kind, from_id),
        Relatable::load(store, to_kind, to_id),
    ) else {
        return Ok(false);
    };
    if !Condition::matches_optional(rule.from_selector.as_ref(), from.selectable())?
        || !Condition::matches_optional(rule.to_selector.as_ref(), to.selectable())?
    {
        return Ok(false);
    }
    let bindings = CelBindings::new()
        .bind("from", from.selectable().to_cel_value())
        .bind("to", to.selectable().to_cel_value());
    Ok(rule.matcher.evaluate(&bindings)?)
}

pub struct RelationshipIndex {
    store: Arc<Store>,
    concurrency: Concurrency,
    rules: RwLock<HashMap<String, Arc<MatchIndex>>>,
}

impl RelationshipIndex {
    pub fn new(store: Arc<Store>, concurrency: Concurrency) -> Self {
        Self {
            store,
            concurrency,
            rules: RwLock::new(HashMap::new()),
        }
    }

    fn build_index(&self, rule: &RelationshipRule) -> Arc<MatchIndex> {
        let store = Arc::clone(&self.store);
        let rule_id = rule.id.clone();
        let index = MatchIndex::new(
            format!("relationship/{}", rule.id),
            Arc::new(move |to: &str, from: &str| edge_matches(&store, &rule_id, to, from)),
        )
        .with_concurrency(self.concurrency);
        for id in ids_of(&self.store, rule.from_kind) {
            index.add_selector(&qualify(rule.from_kind, &id));
        }
        for id in ids_of(&self.store, rule.to_kind) {
            index.add_entity(&qualify(rule.to_kind, &id));
        }
        Arc::new(index)
    }

    /// Register every rule currently in the store.
    pub fn rebuild(&self) {
        let mut rules = HashMap::new();
        for rule in self.store.relationship_rules.values() {
            rules.insert(rule.id.clone(), self.build_index(&rule));
        }
        *self.rules.write() = rules;
    }

    pub fn dirty_all(&self) {
        for index in self.rules.read().values() {
            index.dirty_all();
        }
    }

    pub fn on_change(&self, change: &Change) {
        let removed = change.kind == ChangeKind::Delete;
        if let Entity::RelationshipRule(rule) = &change.entity {
            if removed {
                self.rules.write().remove(&rule.id);
            } else {
                let index = self.build_index(rule);
                self.rules.write().insert(rule.id.clone(), index);
            }
            return;
        }
        let Some((kind, id)) = relatable_kind(&change.entity) else {
            return;
        };
        let qualified = qualify(kind, &id);
        for (rule_id, index) in self.rules.read().iter() {
            let Some(rule) = self.store.relationship_rules.get(rule_id) else {
                continue;
            };
            if rule.from_kind == kind {
                if removed {
                    index.remove_selector(&qualified);
                } else {
                    index.add_selector(&qualified);
                }
            }
            if rule.to_kind == kind {
                if removed {
                    index.remove_entity(&qualified);
                } else {
                    index.add_entity(&qualified);
                }
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.rules.read().values().any(|index| index.is_dirty())
    }

    #[tracing::instrument(name = "RelationshipIndex.Recompute", skip_all)]
    pub fn recompute(&self, cancel: &CancellationToken) -> TargetsResult<usize> {
        let indexes: Vec<Arc<MatchIndex>> = self.rules.read().values().cloned().collect();
        let mut evaluated = 0;
        for index in indexes {
            evaluated += index.recompute(cancel)?;
        }
        debug!(evaluated, rules = self.rule_count(), "relationships recomputed");
        Ok(evaluated)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }

    /// Every edge touching `(kind, id)` across all rules.
    pub fn related(&self, kind: RelatableKind, id: &str) -> Vec<RelatedEntity> {
        let qualified = qualify(kind, id);
        let mut related = Vec::new();
        let rules = self.rules.read();
        let mut rule_ids: Vec<&String> = rules.keys().collect();
        rule_ids.sort();
        for rule_id in rule_ids {
            let Some(rule) = self.store.relationship_rules.get(rule_id) else {
                continue;
            };
            let index = &rules[rule_id];
            let mut push = |direction, other: String| {
                if let Some((other_kind, other_id)) = unqualify(&other) {
                    related.push(RelatedEntity {
                        rule_id: rule.id.clone(),
                        reference: rule.reference.clone(),
                        direction,
                        kind: other_kind,
                        id: other_id.to_string(),
                    });
                }
            };
            if rule.from_kind == kind {
                for to in index.get_matches(&qualified) {
                    push(Direction::Outgoing, to);
                }
            }
            if rule.to_kind == kind {
                for from in index.get_matching_selectors(&qualified) {
                    push(Direction::Incoming, from);
                }
            }
        }
        related
    }

    /// The first entity reached from `(kind, id)` through a rule named
    /// `reference`, as JSON.
    pub fn resolve_reference(&self, reference: &str, kind: RelatableKind, id: &str) -> Option<Value> {
        let edge = self
            .related(kind, id)
            .into_iter()
            .find(|edge| edge.reference == reference)?;
        let related = Relatable::load(&self.store, edge.kind, &edge.id)?;
        Some(related.selectable().to_cel_value())
    }
}

//! Reactive match index: a bipartite entity × selector membership view.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};
use crate::parallel::{Concurrency, evaluate_bounded};

/// Decides whether `entity_id` matches `selector_id`. Runs outside the
/// index lock.
pub type MatchFn = Arc<dyn Fn(&str, &str) -> anyhow::Result<bool> + Send + Sync>;

#[derive(Default)]
struct MatchState {
    entities: HashSet<String>,
    selectors: HashSet<String>,
    dirty_entities: HashSet<String>,
    dirty_selectors: HashSet<String>,
    /// selector -> matching entities
    forward: HashMap<String, HashSet<String>>,
    /// entity -> matching selectors
    reverse: HashMap<String, HashSet<String>>,
}

impl MatchState {
    fn link(&mut self, entity: &str, selector: &str) {
        self.forward
            .entry(selector.to_string())
            .or_default()
            .insert(entity.to_string());
        self.reverse
            .entry(entity.to_string())
            .or_default()
            .insert(selector.to_string());
    }

    fn unlink(&mut self, entity: &str, selector: &str) {
        if let Some(set) = self.forward.get_mut(selector) {
            set.remove(entity);
            if set.is_empty() {
                self.forward.remove(selector);
            }
        }
        if let Some(set) = self.reverse.get_mut(entity) {
            set.remove(selector);
            if set.is_empty() {
                self.reverse.remove(entity);
            }
        }
    }
}

pub struct MatchIndex {
    name: String,
    state: RwLock<MatchState>,
    matcher: MatchFn,
    concurrency: Concurrency,
    allow_self_match: bool,
}

impl MatchIndex {
    pub fn new(name: impl Into<String>, matcher: MatchFn) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MatchState::default()),
            matcher,
            concurrency: Concurrency::Auto,
            allow_self_match: false,
        }
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Let an id match itself when it is registered on both sides.
    pub fn with_self_match(mut self, allow: bool) -> Self {
        self.allow_self_match = allow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Entity side ───────────────────────────────────────────────

    pub fn add_entity(&self, id: &str) {
        let mut state = self.state.write();
        state.entities.insert(id.to_string());
        state.dirty_entities.insert(id.to_string());
    }

    pub fn remove_entity(&self, id: &str) {
        let mut state = self.state.write();
        state.entities.remove(id);
        state.dirty_entities.remove(id);
        if let Some(selectors) = state.reverse.remove(id) {
            for selector in selectors {
                if let Some(set) = state.forward.get_mut(&selector) {
                    set.remove(id);
                    if set.is_empty() {
                        state.forward.remove(&selector);
                    }
                }
            }
        }
    }

    pub fn dirty_entity(&self, id: &str) {
        let mut state = self.state.write();
        if state.entities.contains(id) {
            state.dirty_entities.insert(id.to_string());
        }
    }

    // ── Selector side ─────────────────────────────────────────────

    pub fn add_selector(&self, id: &str) {
        let mut state = self.state.write();
        state.selectors.insert(id.to_string());
        state.dirty_selectors.insert(id.to_string());
    }

    /// Mark a selector dirty after its definition changed.
    pub fn update_selector(&self, id: &str) {
        let mut state = self.state.write();
        if state.selectors.contains(id) {
            state.dirty_selectors.insert(id.to_string());
        }
    }

    pub fn remove_selector(&self, id: &str) {
        let mut state = self.state.write();
        state.selectors.remove(id);
        state.dirty_selectors.remove(id);
        if let Some(entities) = state.forward.remove(id) {
            for entity in entities {
                if let Some(set) = state.reverse.get_mut(&entity) {
                    set.remove(id);
                    if set.is_empty() {
                        state.reverse.remove(&entity);
                    }
                }
            }
        }
    }

    pub fn dirty_all(&self) {
        let mut state = self.state.write();
        let entities: Vec<String> = state.entities.iter().cloned().collect();
        let selectors: Vec<String> = state.selectors.iter().cloned().collect();
        state.dirty_entities.extend(entities);
        state.dirty_selectors.extend(selectors);
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Entities matched by `selector_id`, sorted.
    pub fn get_matches(&self, selector_id: &str) -> Vec<String> {
        let state = self.state.read();
        sorted(state.forward.get(selector_id))
    }

    /// Selectors matching `entity_id`, sorted.
    pub fn get_matching_selectors(&self, entity_id: &str) -> Vec<String> {
        let state = self.state.read();
        sorted(state.reverse.get(entity_id))
    }

    pub fn is_match(&self, entity_id: &str, selector_id: &str) -> bool {
        self.state
            .read()
            .forward
            .get(selector_id)
            .is_some_and(|set| set.contains(entity_id))
    }

    pub fn has_entity(&self, id: &str) -> bool {
        self.state.read().entities.contains(id)
    }

    pub fn has_selector(&self, id: &str) -> bool {
        self.state.read().selectors.contains(id)
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn selector_count(&self) -> usize {
        self.state.read().selectors.len()
    }

    pub fn is_dirty(&self) -> bool {
        let state = self.state.read();
        !state.dirty_entities.is_empty() || !state.dirty_selectors.is_empty()
    }

    /// Verify the forward and reverse maps mirror each other and only
    /// reference registered ids.
    pub fn check_consistency(&self) -> IndexResult<()> {
        let state = self.state.read();
        let inconsistent = |detail: String| IndexError::Inconsistent {
            index: self.name.clone(),
            detail,
        };
        for (selector, entities) in &state.forward {
            if !state.selectors.contains(selector) {
                return Err(inconsistent(format!("unregistered selector {selector}")));
            }
            for entity in entities {
                let mirrored = state
                    .reverse
                    .get(entity)
                    .is_some_and(|set| set.contains(selector));
                if !mirrored || !state.entities.contains(entity) {
                    return Err(inconsistent(format!("dangling match {entity} -> {selector}")));
                }
            }
        }
        let forward_pairs: usize = state.forward.values().map(HashSet::len).sum();
        let reverse_pairs: usize = state.reverse.values().map(HashSet::len).sum();
        if forward_pairs != reverse_pairs {
            return Err(inconsistent(format!(
                "forward has {forward_pairs} pairs, reverse has {reverse_pairs}"
            )));
        }
        Ok(())
    }

    // ── Recompute ─────────────────────────────────────────────────

    /// Evaluate every pair involving a dirty entity or dirty selector.
    /// Returns the number of pairs evaluated.
    #[tracing::instrument(name = "MatchIndex.Recompute", skip_all, fields(index = %self.name))]
    pub fn recompute(&self, cancel: &CancellationToken) -> IndexResult<usize> {
        let (pairs, dirty_entities, dirty_selectors) = {
            let mut state = self.state.write();
            let dirty_entities: Vec<String> = std::mem::take(&mut state.dirty_entities)
                .into_iter()
                .filter(|id| state.entities.contains(id))
                .collect();
            let dirty_selectors: Vec<String> = std::mem::take(&mut state.dirty_selectors)
                .into_iter()
                .filter(|id| state.selectors.contains(id))
                .collect();

            let mut seen: HashSet<(String, String)> = HashSet::new();
            let mut pairs = Vec::new();
            for entity in &dirty_entities {
                for selector in &state.selectors {
                    let pair = (entity.clone(), selector.clone());
                    if seen.insert(pair.clone()) {
                        pairs.push(pair);
                    }
                }
            }
            for selector in &dirty_selectors {
                for entity in &state.entities {
                    let pair = (entity.clone(), selector.clone());
                    if seen.insert(pair.clone()) {
                        pairs.push(pair);
                    }
                }
            }
            (pairs, dirty_entities, dirty_selectors)
        };
        if pairs.is_empty() {
            return Ok(0);
        }

        let matcher = Arc::clone(&self.matcher);
        let allow_self = self.allow_self_match;
        let results = evaluate_bounded(&pairs, self.concurrency, cancel, |(entity, selector)| {
            if !allow_self && entity == selector {
                return Ok(false);
            }
            matcher(entity, selector)
        });

        let mut state = self.state.write();
        if cancel.is_cancelled() {
            for id in dirty_entities {
                if state.entities.contains(&id) {
                    state.dirty_entities.insert(id);
                }
            }
            for id in dirty_selectors {
                if state.selectors.contains(&id) {
                    state.dirty_selectors.insert(id);
                }
            }
            return Err(IndexError::Cancelled {
                index: self.name.clone(),
            });
        }

        let mut evaluated = 0;
        for ((entity, selector), result) in pairs.into_iter().zip(results) {
            let Some(result) = result else { continue };
            evaluated += 1;
            if !state.entities.contains(&entity) || !state.selectors.contains(&selector) {
                continue;
            }
            match result {
                Ok(true) => state.link(&entity, &selector),
                Ok(false) => state.unlink(&entity, &selector),
                Err(err) => warn!(
                    index = %self.name, %entity, %selector, error = %err,
                    "match failed; keeping prior membership"
                ),
            }
        }
        debug!(index = %self.name, evaluated, "recompute complete");
        Ok(evaluated)
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    set.map(|s| s.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect())
        .unwrap_or_default()
}

impl fmt::Debug for MatchIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("MatchIndex")
            .field("name", &self.name)
            .field("entities", &state.entities.len())
            .field("selectors", &state.selectors.len())
            .field("allow_self_match", &self.allow_self_match)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Selector `p` matches entities starting with `p`.
    fn prefix_index() -> MatchIndex {
        MatchIndex::new(
            "prefix",
            Arc::new(|entity: &str, selector: &str| Ok(entity.starts_with(selector))),
        )
        .with_concurrency(Concurrency::Fixed(3))
    }

    fn recompute(index: &MatchIndex) -> usize {
        index.recompute(&CancellationToken::new()).unwrap()
    }

    #[test]
    fn matches_are_queryable_both_ways() {
        let index = prefix_index();
        index.add_entity("apple");
        index.add_entity("avocado");
        index.add_entity("banana");
        index.add_selector("a");
        index.add_selector("b");
        recompute(&index);

        assert_eq!(index.get_matches("a"), vec!["apple", "avocado"]);
        assert_eq!(index.get_matches("b"), vec!["banana"]);
        assert_eq!(index.get_matching_selectors("apple"), vec!["a"]);
        assert!(!index.is_dirty());
        index.check_consistency().unwrap();
    }

    #[test]
    fn dirty_entity_is_reevaluated_against_all_selectors() {
        let index = prefix_index();
        index.add_selector("a");
        index.add_entity("apple");
        recompute(&index);
        assert_eq!(index.get_matches("a"), vec!["apple"]);
        index.dirty_entity("apple");
        assert_eq!(recompute(&index), 1);
    }

    #[test]
    fn removal_purges_both_maps() {
        let index = prefix_index();
        index.add_selector("a");
        index.add_entity("apple");
        recompute(&index);
        index.remove_entity("apple");
        assert!(index.get_matches("a").is_empty());
        assert!(index.get_matching_selectors("apple").is_empty());

        index.add_entity("apricot");
        recompute(&index);
        index.remove_selector("a");
        assert!(index.get_matching_selectors("apricot").is_empty());
        index.check_consistency().unwrap();
    }

    #[test]
    fn self_match_is_excluded_by_default() {
        let index = MatchIndex::new("all", Arc::new(|_: &str, _: &str| Ok(true)));
        for id in ["x", "y"] {
            index.add_entity(id);
            index.add_selector(id);
        }
        recompute(&index);
        assert_eq!(index.get_matches("x"), vec!["y"]);
        assert_eq!(index.get_matching_selectors("x"), vec!["y"]);

        let permissive =
            MatchIndex::new("all", Arc::new(|_: &str, _: &str| Ok(true))).with_self_match(true);
        permissive.add_entity("x");
        permissive.add_selector("x");
        recompute(&permissive);
        assert_eq!(permissive.get_matches("x"), vec!["x"]);
    }

    #[test]
    fn match_error_keeps_prior_membership() {
        let index = MatchIndex::new(
            "err",
            Arc::new(|entity: &str, _: &str| {
                if entity == "broken" {
                    anyhow::bail!("cannot evaluate");
                }
                Ok(true)
            }),
        );
        index.add_entity("broken");
        index.add_selector("s");
        recompute(&index);
        assert!(index.get_matches("s").is_empty());
    }

    #[test]
    fn dirtying_unknown_ids_is_noop() {
        let index = prefix_index();
        index.dirty_entity("ghost");
        index.update_selector("ghost");
        assert!(!index.is_dirty());
    }
}

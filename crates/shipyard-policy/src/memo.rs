//! Memoization of evaluator results by scope fingerprint.

use std::sync::Arc;

use shipyard_collections::ShardedMap;
use shipyard_core::{EntityKind, RuleType, SharedClock};
use tracing::debug;

use crate::error::PolicyResult;
use crate::evaluator::{Evaluator, RuleEvaluation};
use crate::scope::{EvaluatorScope, ScopeFields};

#[derive(Debug, Clone)]
struct CachedEvaluation {
    rule_type: RuleType,
    evaluation: RuleEvaluation,
}

/// Whether a change to `kind` can alter a `rule_type` verdict.
fn invalidated_by(rule_type: RuleType, kind: EntityKind) -> bool {
    use EntityKind as K;
    match kind {
        K::Policy | K::System | K::Workspace => true,
        _ => match rule_type {
            RuleType::AnyApproval => kind == K::UserApprovalRecord,
            RuleType::VersionSelector => kind == K::DeploymentVersion,
            RuleType::DeploymentDependency => matches!(
                kind,
                K::Job | K::Release | K::Deployment | K::Environment | K::Resource
            ),
            _ => true,
        },
    }
}

/// Thread-safe cache shared by every memoized evaluator of a factory.
#[derive(Debug)]
pub struct MemoCache {
    entries: ShardedMap<CachedEvaluation>,
    capacity: usize,
    clock: SharedClock,
}

impl MemoCache {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            entries: ShardedMap::new(),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// A cached verdict, unless its `next_evaluation_time` has passed.
    pub fn get(&self, key: &str) -> Option<RuleEvaluation> {
        let cached = self.entries.get(key)?;
        if let Some(at) = cached.evaluation.next_evaluation_time
            && at <= self.clock.now()
        {
            self.entries.remove(key);
            return None;
        }
        Some(cached.evaluation)
    }

    pub fn put(&self, key: String, rule_type: RuleType, evaluation: RuleEvaluation) {
        if self.entries.count() >= self.capacity {
            debug!(capacity = self.capacity, "memo cache full; clearing");
            self.entries.clear();
        }
        self.entries.set(
            key,
            CachedEvaluation {
                rule_type,
                evaluation,
            },
        );
    }

    /// Drop every entry whose rule type depends on `kind`.
    pub fn invalidate_kind(&self, kind: EntityKind) {
        self.entries
            .retain(|_, cached| !invalidated_by(cached.rule_type, kind));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wraps an evaluator, caching successful verdicts per scope fingerprint.
pub struct MemoizedEvaluator {
    inner: Arc<dyn Evaluator>,
    cache: Arc<MemoCache>,
}

impl MemoizedEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>, cache: Arc<MemoCache>) -> Self {
        Self { inner, cache }
    }
}

impl Evaluator for MemoizedEvaluator {
    fn rule_type(&self) -> RuleType {
        self.inner.rule_type()
    }

    fn rule_id(&self) -> &str {
        self.inner.rule_id()
    }

    fn complexity(&self) -> u8 {
        self.inner.complexity()
    }

    fn scope_fields(&self) -> ScopeFields {
        self.inner.scope_fields()
    }

    fn evaluate(&self, scope: &EvaluatorScope) -> PolicyResult<RuleEvaluation> {
        let key = format!(
            "{}#{}",
            self.inner.rule_id(),
            scope.fingerprint(self.inner.scope_fields())
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let evaluation = self.inner.evaluate(scope)?;
        self.cache
            .put(key, self.inner.rule_type(), evaluation.clone());
        Ok(evaluation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use shipyard_core::ManualClock;

    #[test]
    fn expired_entries_are_dropped() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::shared(start);
        let cache = MemoCache::new(10, clock.clone());
        cache.put(
            "k".into(),
            RuleType::AnyApproval,
            RuleEvaluation::deny("wait").retry_at(start + Duration::seconds(60)),
        );
        assert!(cache.get("k").is_some());
        clock.advance(Duration::seconds(60));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_is_by_entity_kind() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cache = MemoCache::new(10, clock);
        cache.put("a".into(), RuleType::AnyApproval, RuleEvaluation::allow("ok"));
        cache.put("v".into(), RuleType::VersionSelector, RuleEvaluation::allow("ok"));

        cache.invalidate_kind(EntityKind::UserApprovalRecord);
        assert!(cache.get("a").is_none());
        assert!(cache.get("v").is_some());

        cache.invalidate_kind(EntityKind::Policy);
        assert!(cache.is_empty());
    }

    #[test]
    fn full_cache_starts_over() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let cache = MemoCache::new(2, clock);
        cache.put("1".into(), RuleType::AnyApproval, RuleEvaluation::allow("ok"));
        cache.put("2".into(), RuleType::AnyApproval, RuleEvaluation::allow("ok"));
        cache.put("3".into(), RuleType::AnyApproval, RuleEvaluation::allow("ok"));
        assert_eq!(cache.len(), 1);
    }
}

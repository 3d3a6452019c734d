//! ShardedMap: a fixed-shard, string-keyed concurrent map.
//!
//! A key's shard is `fnv1a_32(key) % shard_count`. Every shard has its own
//! `RwLock`, so operations on keys in different shards proceed in parallel.
//! The shard count is read from a process-wide setting when the map is
//! constructed and never changes afterwards.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::fnv::fnv1a_32;

/// Shard count used by maps built with [`ShardedMap::new`] unless overridden.
pub const DEFAULT_SHARD_COUNT: usize = 32;

static SHARD_COUNT: AtomicUsize = AtomicUsize::new(DEFAULT_SHARD_COUNT);

/// Override the shard count for maps constructed from now on.
///
/// Meant to be called once at startup (or by tests that need a
/// deterministic layout). Existing maps keep their shard count.
pub fn set_shard_count(count: usize) {
    SHARD_COUNT.store(count.max(1), Ordering::Relaxed);
}

/// The shard count new maps will use.
pub fn shard_count() -> usize {
    SHARD_COUNT.load(Ordering::Relaxed)
}

type Shard<V> = RwLock<HashMap<String, V>>;

/// Concurrent map from `String` keys to `V`.
pub struct ShardedMap<V> {
    shards: Box<[Shard<V>]>,
}

impl<V> ShardedMap<V> {
    /// Create a map using the process-wide shard count.
    pub fn new() -> Self {
        Self::with_shards(shard_count())
    }

    /// Create a map with an explicit shard count (minimum 1).
    pub fn with_shards(count: usize) -> Self {
        let shards = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    /// Number of shards this map was built with.
    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, key: &str) -> &Shard<V> {
        let index = fnv1a_32(key) as usize % self.shards.len();
        &self.shards[index]
    }

    // ── Single-key operations ──────────────────────────────────────

    /// Insert or overwrite `key`.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        self.shard(&key).write().insert(key, value);
    }

    /// Insert only if `key` is absent. Returns true if the value was stored.
    pub fn set_if_absent(&self, key: impl Into<String>, value: V) -> bool {
        let key = key.into();
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return false;
        }
        shard.insert(key, value);
        true
    }

    pub fn has(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Run `f` against the value under the shard read lock.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).read().get(key).map(f)
    }

    /// Remove `key`. Returns true if it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key).write().remove(key).is_some()
    }

    /// Remove `key` if `predicate` (called with the current value, if any)
    /// returns true. Returns true if an entry was removed.
    pub fn remove_if(&self, key: &str, predicate: impl FnOnce(Option<&V>) -> bool) -> bool {
        let mut shard = self.shard(key).write();
        if predicate(shard.get(key)) {
            return shard.remove(key).is_some();
        }
        false
    }

    /// Remove `key` and return its value.
    pub fn pop(&self, key: &str) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Atomic read-modify-write.
    ///
    /// `cb` receives `(exists, current, new_value)` under the shard write
    /// lock and returns the value to store.
    pub fn upsert_with<R>(
        &self,
        key: impl Into<String>,
        value: V,
        cb: impl FnOnce(bool, Option<&V>, V) -> V,
        read: impl FnOnce(&V) -> R,
    ) -> R {
        let key = key.into();
        let mut shard = self.shard(&key).write();
        let current = shard.get(&key);
        let next = cb(current.is_some(), current, value);
        let result = read(&next);
        shard.insert(key, next);
        result
    }

    // ── Whole-map operations ───────────────────────────────────────

    pub fn count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    /// Insert every entry, locking each shard once per entry.
    pub fn mset(&self, entries: impl IntoIterator<Item = (String, V)>) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&self, mut keep: impl FnMut(&str, &V) -> bool) {
        for shard in self.shards.iter() {
            shard.write().retain(|k, v| keep(k, v));
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for shard in self.shards.iter() {
            keys.extend(shard.read().keys().cloned());
        }
        keys
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    /// Atomic read-modify-write returning the stored value.
    pub fn upsert(
        &self,
        key: impl Into<String>,
        value: V,
        cb: impl FnOnce(bool, Option<&V>, V) -> V,
    ) -> V {
        self.upsert_with(key, value, cb, V::clone)
    }

    /// Lazy iteration: each shard is copied under its read lock when the
    /// iterator reaches it, then released before entries are yielded.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            map: self,
            next_shard: 0,
            current: Vec::new().into_iter(),
        }
    }

    /// Copy every shard up front, for iteration that outlives short locks.
    pub fn iter_buffered(&self) -> std::vec::IntoIter<(String, V)> {
        let mut all = Vec::with_capacity(self.count());
        for shard in self.shards.iter() {
            let guard = shard.read();
            all.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        all.into_iter()
    }

    pub fn values(&self) -> Vec<V> {
        self.iter().map(|(_, v)| v).collect()
    }

    /// Flat snapshot of the whole map.
    pub fn items(&self) -> HashMap<String, V> {
        self.iter_buffered().collect()
    }

    /// Build a map from a flat mapping.
    pub fn from_flat(flat: HashMap<String, V>) -> Self {
        let map = Self::new();
        map.mset(flat);
        map
    }
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + fmt::Debug> fmt::Debug for ShardedMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter_buffered()).finish()
    }
}

/// Iterator returned by [`ShardedMap::iter`].
pub struct Iter<'a, V> {
    map: &'a ShardedMap<V>,
    next_shard: usize,
    current: std::vec::IntoIter<(String, V)>,
}

impl<V: Clone> Iterator for Iter<'_, V> {
    type Item = (String, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(entry);
            }
            let shard = self.map.shards.get(self.next_shard)?;
            self.next_shard += 1;
            let snapshot: Vec<(String, V)> = shard
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.current = snapshot.into_iter();
        }
    }
}

// ── Serialization ──────────────────────────────────────────────────

impl<V: Serialize> Serialize for ShardedMap<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
        let len = guards.iter().map(|g| g.len()).sum();
        let mut map = serializer.serialize_map(Some(len))?;
        for guard in &guards {
            for (k, v) in guard.iter() {
                map.serialize_entry(k, v)?;
            }
        }
        map.end()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for ShardedMap<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlatVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for FlatVisitor<V> {
            type Value = ShardedMap<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of string keys")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let map = ShardedMap::new();
                while let Some((key, value)) = access.next_entry::<String, V>()? {
                    map.set(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(FlatVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn set_get_remove() {
        let map = ShardedMap::with_shards(4);
        map.set("a", 1);
        map.set("b", 2);
        assert_eq!(map.get("a"), Some(1));
        assert!(map.has("b"));
        assert_eq!(map.count(), 2);

        assert!(map.remove("a"));
        assert!(!map.remove("a"));
        assert_eq!(map.pop("b"), Some(2));
        assert!(map.is_empty());
    }

    #[test]
    fn set_if_absent_keeps_first() {
        let map = ShardedMap::with_shards(2);
        assert!(map.set_if_absent("k", "first"));
        assert!(!map.set_if_absent("k", "second"));
        assert_eq!(map.get("k"), Some("first"));
    }

    #[test]
    fn remove_if_consults_current_value() {
        let map = ShardedMap::with_shards(2);
        map.set("k", 10);
        assert!(!map.remove_if("k", |v| v == Some(&11)));
        assert!(map.remove_if("k", |v| v == Some(&10)));
        assert!(!map.remove_if("missing", |v| v.is_none()));
    }

    #[test]
    fn upsert_sees_existing_value() {
        let map = ShardedMap::with_shards(3);
        let stored = map.upsert("n", 5, |exists, _, new| {
            assert!(!exists);
            new
        });
        assert_eq!(stored, 5);

        let stored = map.upsert("n", 7, |exists, current, new| {
            assert!(exists);
            current.copied().unwrap_or_default() + new
        });
        assert_eq!(stored, 12);
        assert_eq!(map.get("n"), Some(12));
    }

    #[test]
    fn iter_covers_every_shard() {
        let map = ShardedMap::with_shards(8);
        map.mset((0..100).map(|i| (format!("key-{i}"), i)));

        let mut seen: Vec<i32> = map.iter().map(|(_, v)| v).collect();
        seen.sort();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        assert_eq!(map.iter_buffered().count(), 100);
        assert_eq!(map.keys().len(), 100);
    }

    #[test]
    fn iteration_survives_concurrent_mutation() {
        let map = ShardedMap::with_shards(4);
        map.mset((0..50).map(|i| (format!("k{i}"), i)));
        let mut iter = map.iter();
        let first = iter.next();
        assert!(first.is_some());
        // Mutating while an iterator is alive must not deadlock.
        map.set("late", 999);
        map.remove("k1");
        let rest = iter.count();
        assert!(rest >= 48);
    }

    #[test]
    fn retain_filters_entries() {
        let map = ShardedMap::with_shards(4);
        map.mset((0..10).map(|i| (i.to_string(), i)));
        map.retain(|_, v| v % 2 == 0);
        assert_eq!(map.count(), 5);
    }

    #[test]
    fn parallel_writers() {
        let map = Arc::new(ShardedMap::with_shards(16));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        map.set(format!("{t}-{i}"), i);
                        map.upsert("counter", 1, |_, current, new| {
                            current.copied().unwrap_or(0) + new
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.count(), 8 * 500 + 1);
        assert_eq!(map.get("counter"), Some(8 * 500));
    }

    #[test]
    fn serde_roundtrip_through_flat_mapping() {
        let map = ShardedMap::with_shards(5);
        map.mset([("x".to_string(), 1u32), ("y".to_string(), 2), ("z".to_string(), 3)]);

        let json = serde_json::to_string(&map).unwrap();
        let back: ShardedMap<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.items(), map.items());

        let rebuilt = ShardedMap::from_flat(map.items());
        assert_eq!(rebuilt.items(), map.items());
    }

    #[test]
    fn shard_count_is_captured_at_construction() {
        let before = shard_count();
        let explicit = ShardedMap::<u8>::with_shards(7);
        assert_eq!(explicit.shards(), 7);
        assert_eq!(ShardedMap::<u8>::with_shards(0).shards(), 1);
        assert!(before >= 1);
    }
}

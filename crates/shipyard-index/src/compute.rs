//! Reactive compute index: one derived value per registered id.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IndexError, IndexResult};
use crate::parallel::{Concurrency, evaluate_bounded};

/// Computes the value for one id. Runs outside the index lock.
pub type ComputeFn<V> = Arc<dyn Fn(&str) -> anyhow::Result<V> + Send + Sync>;

struct ComputeState<V> {
    entities: HashSet<String>,
    values: HashMap<String, V>,
    dirty: HashSet<String>,
}

pub struct ComputeIndex<V> {
    name: String,
    state: RwLock<ComputeState<V>>,
    eval: ComputeFn<V>,
    concurrency: Concurrency,
}

impl<V: Send + Sync> ComputeIndex<V> {
    pub fn new(name: impl Into<String>, eval: ComputeFn<V>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(ComputeState {
                entities: HashSet::new(),
                values: HashMap::new(),
                dirty: HashSet::new(),
            }),
            eval,
            concurrency: Concurrency::Auto,
        }
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `id` and mark it dirty. Idempotent.
    pub fn add_entity(&self, id: &str) {
        let mut state = self.state.write();
        state.entities.insert(id.to_string());
        state.dirty.insert(id.to_string());
    }

    /// Unregister `id`, dropping its value and dirty bit.
    pub fn remove_entity(&self, id: &str) {
        let mut state = self.state.write();
        state.entities.remove(id);
        state.values.remove(id);
        state.dirty.remove(id);
    }

    /// Mark a registered id dirty; unknown ids are ignored.
    pub fn dirty_entity(&self, id: &str) {
        let mut state = self.state.write();
        if state.entities.contains(id) {
            state.dirty.insert(id.to_string());
        }
    }

    pub fn dirty_all(&self) {
        let mut state = self.state.write();
        let all: Vec<String> = state.entities.iter().cloned().collect();
        state.dirty.extend(all);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().entities.contains(id)
    }

    /// Visit every computed value until `f` returns false.
    pub fn for_each(&self, mut f: impl FnMut(&str, &V) -> bool) {
        let state = self.state.read();
        for (id, value) in &state.values {
            if !f(id, value) {
                break;
            }
        }
    }

    pub fn entity_count(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.state.read().dirty.len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.read().dirty.is_empty()
    }

    /// Re-evaluate every dirty id. Returns the number of evaluations
    /// performed. Ids dirtied while the batch runs wait for the next call.
    #[tracing::instrument(name = "ComputeIndex.Recompute", skip_all, fields(index = %self.name))]
    pub fn recompute(&self, cancel: &CancellationToken) -> IndexResult<usize> {
        let batch: Vec<String> = {
            let mut state = self.state.write();
            let dirty = std::mem::take(&mut state.dirty);
            dirty
                .into_iter()
                .filter(|id| state.entities.contains(id))
                .collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let eval = Arc::clone(&self.eval);
        let results = evaluate_bounded(&batch, self.concurrency, cancel, |id| eval(id));

        let mut state = self.state.write();
        if cancel.is_cancelled() {
            for id in batch {
                if state.entities.contains(&id) {
                    state.dirty.insert(id);
                }
            }
            return Err(IndexError::Cancelled {
                index: self.name.clone(),
            });
        }

        let mut evaluated = 0;
        for (id, result) in batch.into_iter().zip(results) {
            let Some(result) = result else { continue };
            evaluated += 1;
            if !state.entities.contains(&id) {
                continue;
            }
            match result {
                Ok(value) => {
                    state.values.insert(id, value);
                }
                Err(err) => warn!(index = %self.name, %id, error = %err, "evaluation failed; keeping prior value"),
            }
        }
        debug!(index = %self.name, evaluated, "recompute complete");
        Ok(evaluated)
    }
}

impl<V: Clone + Send + Sync> ComputeIndex<V> {
    pub fn get(&self, id: &str) -> Option<V> {
        self.state.read().values.get(id).cloned()
    }
}

impl<V> fmt::Debug for ComputeIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("ComputeIndex")
            .field("name", &self.name)
            .field("entities", &state.entities.len())
            .field("dirty", &state.dirty.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn length_index() -> ComputeIndex<usize> {
        ComputeIndex::new("len", Arc::new(|id: &str| Ok(id.len())))
            .with_concurrency(Concurrency::Fixed(2))
    }

    #[test]
    fn recompute_clears_dirty_and_stores_values() {
        let index = length_index();
        index.add_entity("abc");
        index.add_entity("de");
        assert_eq!(index.dirty_count(), 2);
        let n = index.recompute(&CancellationToken::new()).unwrap();
        assert_eq!(n, 2);
        assert!(!index.is_dirty());
        assert_eq!(index.get("abc"), Some(3));
        assert_eq!(index.get("de"), Some(2));
    }

    #[test]
    fn dirtying_unknown_id_is_noop() {
        let index = length_index();
        index.dirty_entity("ghost");
        assert!(!index.is_dirty());
        assert_eq!(index.entity_count(), 0);
    }

    #[test]
    fn errors_keep_prior_value() {
        let fail = Arc::new(AtomicUsize::new(0));
        let fail2 = Arc::clone(&fail);
        let index: ComputeIndex<usize> = ComputeIndex::new(
            "flaky",
            Arc::new(move |id: &str| {
                if fail2.load(Ordering::SeqCst) == 1 {
                    anyhow::bail!("boom");
                }
                Ok(id.len())
            }),
        );
        index.add_entity("abcd");
        index.recompute(&CancellationToken::new()).unwrap();
        fail.store(1, Ordering::SeqCst);
        index.dirty_entity("abcd");
        index.recompute(&CancellationToken::new()).unwrap();
        assert_eq!(index.get("abcd"), Some(4));
    }

    #[test]
    fn removal_drops_value() {
        let index = length_index();
        index.add_entity("abc");
        index.recompute(&CancellationToken::new()).unwrap();
        index.remove_entity("abc");
        assert_eq!(index.get("abc"), None);
        index.remove_entity("abc");
        assert_eq!(index.entity_count(), 0);
    }

    #[test]
    fn removal_during_evaluation_wins() {
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = parking_lot::Mutex::new(release_rx);
        let index: ComputeIndex<usize> = ComputeIndex::new(
            "gated",
            Arc::new(move |id: &str| {
                let _ = started_tx.send(());
                let _ = release_rx.lock().recv();
                Ok(id.len())
            }),
        );
        index.add_entity("abc");

        std::thread::scope(|s| {
            let run = s.spawn(|| index.recompute(&CancellationToken::new()));
            started_rx.recv().unwrap();
            index.remove_entity("abc");
            release_tx.send(()).unwrap();
            assert_eq!(run.join().unwrap().unwrap(), 1);
        });
        assert_eq!(index.get("abc"), None);
        assert!(!index.contains("abc"));
        assert!(!index.is_dirty());
        let mut seen = 0;
        index.for_each(|_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 0);
    }

    #[test]
    fn cancelled_recompute_redirties() {
        let index = length_index();
        index.add_entity("abc");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            index.recompute(&cancel),
            Err(IndexError::Cancelled { .. })
        ));
        assert!(index.is_dirty());
        assert_eq!(index.get("abc"), None);
    }

    #[test]
    fn for_each_stops_early() {
        let index = length_index();
        for id in ["a", "b", "c"] {
            index.add_entity(id);
        }
        index.recompute(&CancellationToken::new()).unwrap();
        let mut seen = 0;
        index.for_each(|_, _| {
            seen += 1;
            false
        });
        assert_eq!(seen, 1);
    }
}

//! Memoizing loader: bounded LRU with per-key single-flight.
//!
//! Concurrent `get_or_load` calls for the same key run the load once; the
//! others wait on the key's gate and then read the cached value. Failed
//! loads are not cached, so the next caller retries.

use lru::LruCache;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Gate = Arc<tokio::sync::Mutex<()>>;

/// A key's gate and the number of callers currently holding it.
type Inflight<K> = HashMap<K, (Gate, usize)>;

pub struct Loader<K, V> {
    cache: Mutex<LruCache<K, V>>,
    inflight: Mutex<Inflight<K>>,
}

impl<K, V> Loader<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Builds a loader, treating a zero capacity as one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN))
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<K, V>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.cache().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.cache().put(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.cache().pop(key);
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value for `key`, running `load` on a miss.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let entry = InflightEntry::join(&self.inflight, key.clone());

        let _held = entry.gate.lock().await;
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let loaded = load().await;
        if let Ok(value) = &loaded {
            self.insert(key, value.clone());
        }
        loaded
    }
}

/// A caller's claim on a key's gate. Dropping it, on completion or when the
/// caller's future is abandoned, removes the gate once no one else holds it.
struct InflightEntry<'a, K>
where
    K: Hash + Eq,
{
    gate: Gate,
    inflight: &'a Mutex<Inflight<K>>,
    key: K,
}

impl<'a, K> InflightEntry<'a, K>
where
    K: Hash + Eq + Clone,
{
    fn join(inflight: &'a Mutex<Inflight<K>>, key: K) -> Self {
        let gate = {
            let mut map = inflight.lock().unwrap_or_else(PoisonError::into_inner);
            let (gate, holders) = map
                .entry(key.clone())
                .or_insert_with(|| (Gate::default(), 0));
            *holders += 1;
            Arc::clone(gate)
        };
        Self { gate, inflight, key }
    }
}

impl<K> Drop for InflightEntry<'_, K>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        let mut map = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, holders)) = map.get_mut(&self.key) {
            *holders -= 1;
            if *holders == 0 {
                map.remove(&self.key);
            }
        }
    }
}

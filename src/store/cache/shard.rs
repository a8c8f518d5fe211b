//! Sharded Map
//!
//! A hashmap split into `N` independently locked shards. `N` must be a power
//! of two so the shard index is a mask of the key hash.
//!
//! Whole-map passes (`retain`, folds) take one shard lock at a time, so a
//! sweep never stalls readers of the other shards.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// One lock and the entries it guards
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Shard<K, V> {
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Fold over every entry under the read lock
    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, &K, &V) -> A) -> A {
        self.map
            .read()
            .iter()
            .fold(init, |acc, (k, v)| f(acc, k, v))
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Run `f` against the value for `key` while holding the read lock
    pub fn read_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.map.read().get(key).map(f)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.map.write().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.map.write().remove(key)
    }

    /// Drop entries for which `keep` is false; returns how many were dropped
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let mut map = self.map.write();
        let before = map.len();
        map.retain(|k, v| keep(k, v));
        before - map.len()
    }
}

/// Map of `N` shards
pub struct ShardedMap<K, V, const N: usize> {
    shards: Vec<Shard<K, V>>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            shards: (0..N).map(|_| Shard::default()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(Shard::is_empty)
    }

    pub fn shards(&self) -> impl Iterator<Item = &Shard<K, V>> {
        self.shards.iter()
    }

    pub fn clear(&self) {
        self.shards.iter().for_each(Shard::clear);
    }
}

impl<K: Eq + Hash, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn read_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.shard(key).read_with(key, f)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).contains_key(key)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).remove(key)
    }

    /// Retain across every shard; returns the total dropped
    pub fn retain(&self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        self.shards.iter().map(|shard| shard.retain(&mut keep)).sum()
    }
}

// =============================================================================
// Tests
// =============================================================================

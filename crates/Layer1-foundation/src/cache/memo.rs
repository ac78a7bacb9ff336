//! Memoization cache held outside the records it describes
//!
//! Values are computed on first access and kept until the owning key is
//! invalidated. Records stay plain data; derived facts live here.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// Keyed memo table with explicit invalidation
#[derive(Debug)]
pub struct MemoCache<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> MemoCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, if any
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    /// Return the cached value or compute, store and return it
    ///
    /// `compute` runs without holding the lock; if two callers race, the
    /// first stored value wins and both observe it.
    pub fn get_or_insert_with(&self, key: &K, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.entries
            .write()
            .entry(key.clone())
            .or_insert(value)
            .clone()
    }

    /// Drop the cached value for `key`; returns whether one existed
    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_computes_once() {
        let cache: MemoCache<String, bool> = MemoCache::new();
        let calls = Cell::new(0);

        for _ in 0..3 {
            let value = cache.get_or_insert_with(&"env-1".to_string(), || {
                calls.set(calls.get() + 1);
                true
            });
            assert!(value);
        }

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_invalidate_recomputes() {
        let cache: MemoCache<&str, u32> = MemoCache::new();
        assert_eq!(cache.get_or_insert_with(&"env", || 1), 1);

        assert!(cache.invalidate(&"env"));
        assert!(!cache.invalidate(&"env"));
        assert_eq!(cache.get_or_insert_with(&"env", || 2), 2);
        assert_eq!(cache.len(), 1);
    }
}

//! Per-class identity cache
//!
//! Maps `(table, primary key)` to the currently live instance through weak
//! references, so concurrently loaded rows with the same identity resolve
//! to one shared instance. A cache hit returns the existing instance
//! unchanged; the cache models "the same conceptual object", not "the
//! latest row snapshot". Once every strong handle drops, the entry dies
//! with it and a later load materializes a fresh instance — a collected
//! instance is never resurrected.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::error::Result;

/// A live, shared instance of a persisted record
pub type Shared<M> = Arc<RwLock<M>>;

type AnyWeak = Weak<dyn Any + Send + Sync>;

pub(crate) struct IdentityCache {
    entries: HashMap<(&'static str, i64), AnyWeak>,
    purge_at: usize,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            purge_at: 64,
        }
    }

    /// Returns the live instance for `(table, id)` if one exists, otherwise
    /// materializes one with `make`, registers it weakly, and returns it.
    pub fn materialize<M, F>(&mut self, table: &'static str, id: i64, make: F) -> Result<Shared<M>>
    where
        M: Send + Sync + 'static,
        F: FnOnce() -> Result<M>,
    {
        if let Some(existing) = self.live::<M>(table, id) {
            return Ok(existing);
        }
        let instance = Arc::new(RwLock::new(make()?));
        self.insert(table, id, &instance);
        Ok(instance)
    }

    /// Points the entry for `(table, id)` at this instance. Used after
    /// save and update so the key maps to the instance just written.
    pub fn insert<M>(&mut self, table: &'static str, id: i64, instance: &Shared<M>)
    where
        M: Send + Sync + 'static,
    {
        if self.entries.len() >= self.purge_at {
            self.purge_dead();
        }
        let erased: Arc<dyn Any + Send + Sync> = instance.clone();
        self.entries.insert((table, id), Arc::downgrade(&erased));
    }

    pub fn remove(&mut self, table: &'static str, id: i64) {
        self.entries.remove(&(table, id));
    }

    fn live<M>(&self, table: &'static str, id: i64) -> Option<Shared<M>>
    where
        M: Send + Sync + 'static,
    {
        let strong = self.entries.get(&(table, id))?.upgrade()?;
        // a table re-registered for a different type leaves stale entries;
        // those fail the downcast and count as a miss
        strong.downcast::<RwLock<M>>().ok()
    }

    fn purge_dead(&mut self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        self.purge_at = (self.entries.len() * 2).max(64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_returns_same_instance() {
        let mut cache = IdentityCache::new();
        let first: Shared<String> = cache
            .materialize("t", 1, || Ok("original".to_string()))
            .unwrap();
        let second: Shared<String> = cache
            .materialize("t", 1, || Ok("fresh".to_string()))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second.read().unwrap(), "original");
    }

    #[test]
    fn test_dropped_instance_is_not_resurrected() {
        let mut cache = IdentityCache::new();
        let first: Shared<String> = cache
            .materialize("t", 1, || Ok("original".to_string()))
            .unwrap();
        drop(first);
        let second: Shared<String> = cache
            .materialize("t", 1, || Ok("fresh".to_string()))
            .unwrap();
        assert_eq!(*second.read().unwrap(), "fresh");
    }

    #[test]
    fn test_remove_detaches_entry() {
        let mut cache = IdentityCache::new();
        let first: Shared<i64> = cache.materialize("t", 5, || Ok(1)).unwrap();
        cache.remove("t", 5);
        let second: Shared<i64> = cache.materialize("t", 5, || Ok(2)).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_entries_are_per_table() {
        let mut cache = IdentityCache::new();
        let a: Shared<i64> = cache.materialize("a", 1, || Ok(1)).unwrap();
        let b: Shared<i64> = cache.materialize("b", 1, || Ok(2)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_purge_drops_dead_entries() {
        let mut cache = IdentityCache::new();
        for i in 0..200 {
            let handle: Shared<i64> = cache.materialize("t", i, || Ok(i)).unwrap();
            drop(handle);
        }
        let keeper: Shared<i64> = cache.materialize("t", 1000, || Ok(0)).unwrap();
        assert!(cache.entries.len() < 200);
        drop(keeper);
    }
}

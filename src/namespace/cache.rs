//! Bounded least-recently-used cache of path resolutions.

use std::collections::{BTreeMap, HashMap};

use crate::namespace::is_within;

/// LRU cache from normalized path to resolved value. Recency is tracked by a
/// monotonically increasing access tick: the entry with the smallest tick is
/// the least recently used one.
#[derive(Debug)]
pub struct ResolveCache<T> {
    /// Maximum number of cached entries. Zero disables caching.
    capacity: usize,

    /// Next access tick to hand out.
    tick: u64,

    /// Map from path -> (value, last access tick).
    entries: HashMap<String, (T, u64)>,

    /// Map from access tick -> path, ordered oldest first.
    recency: BTreeMap<u64, String>,
}

impl<T: Clone> ResolveCache<T> {
    /// Creates an empty cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        ResolveCache {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Looks up `path`, marking it as most recently used on a hit.
    pub fn get(&mut self, path: &str) -> Option<T> {
        let tick = self.next_tick();
        let (value, last) = self.entries.get_mut(path)?;
        let old = std::mem::replace(last, tick);
        let value = value.clone();
        if let Some(key) = self.recency.remove(&old) {
            self.recency.insert(tick, key);
        }
        Some(value)
    }

    /// Inserts or overwrites the entry for `path`, evicting the least
    /// recently used entry if the cache is full.
    pub fn put(&mut self, path: &str, value: T) {
        if self.capacity == 0 {
            return;
        }
        self.invalidate(path);
        while self.entries.len() >= self.capacity {
            match self.recency.pop_first() {
                Some((_, victim)) => {
                    self.entries.remove(&victim);
                }
                None => break,
            }
        }

        let tick = self.next_tick();
        self.entries.insert(path.to_string(), (value, tick));
        self.recency.insert(tick, path.to_string());
    }

    /// Drops the entry for exactly `path`. Returns whether it was present.
    pub fn invalidate(&mut self, path: &str) -> bool {
        match self.entries.remove(path) {
            Some((_, tick)) => {
                self.recency.remove(&tick);
                true
            }
            None => false,
        }
    }

    /// Drops every entry at or below `prefix`. Returns the number dropped.
    pub fn invalidate_prefix(&mut self, prefix: &str) -> usize {
        self.invalidate_where(|path, _| is_within(path, prefix))
    }

    /// Drops every entry whose cached value satisfies `stale`. Returns the
    /// number dropped.
    pub fn invalidate_value<F>(&mut self, mut stale: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        self.invalidate_where(|_, value| stale(value))
    }

    fn invalidate_where<F>(&mut self, mut stale: F) -> usize
    where
        F: FnMut(&str, &T) -> bool,
    {
        let victims: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|(path, (value, _))| stale(path, value))
            .map(|(path, (_, tick))| (path.clone(), *tick))
            .collect();
        for (path, tick) in &victims {
            self.entries.remove(path);
            self.recency.remove(tick);
        }
        victims.len()
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    #[test]
    fn get_put_hit_miss() {
        let mut cache = ResolveCache::new(4);
        assert_eq!(cache.get("x"), None);
        cache.put("x", 1);
        assert_eq!(cache.get("x"), Some(1));
        cache.put("x", 2);
        assert_eq!(cache.get("x"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = ResolveCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        // touch "a" so that "b" becomes the LRU victim
        assert_eq!(cache.get("a"), Some(1));
        cache.put("c", 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn zero_capacity_disables() {
        let mut cache = ResolveCache::new(0);
        cache.put("a", 1);
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn invalidate_variants() {
        let mut cache = ResolveCache::new(8);
        cache.put("d", 1);
        cache.put("d/a", 1);
        cache.put("d/b", 2);
        cache.put("dd", 3);
        cache.put("e", 2);
        assert!(cache.invalidate("e"));
        assert!(!cache.invalidate("e"));
        assert_eq!(cache.invalidate_prefix("d"), 3);
        assert_eq!(cache.get("dd"), Some(3));
        cache.put("f", 3);
        assert_eq!(cache.invalidate_value(|&v| v == 3), 2);
        assert!(cache.is_empty());
    }
}

//! Naming server's authoritative namespace: the path trie together with the
//! resolution cache in front of it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::namespace::{normalize_path, rebase_path, PathTrie, ResolveCache};
use crate::protocol::ServerId;
use crate::utils::NetFsError;

#[derive(Debug)]
struct NamespaceInner {
    /// Map from normalized path -> owning storage server.
    trie: PathTrie<ServerId>,

    /// Recently resolved paths.
    cache: ResolveCache<ServerId>,
}

/// Path -> storage server mapping. Every mutator invalidates the affected
/// cache entries under the same lock that mutates the trie, so a cached
/// resolution is never staler than the last trie mutation.
#[derive(Debug)]
pub struct Namespace {
    inner: Mutex<NamespaceInner>,
}

impl Namespace {
    /// Creates an empty namespace whose cache holds at most `cache_capacity`
    /// resolutions.
    pub fn new(cache_capacity: usize) -> Self {
        Namespace {
            inner: Mutex::new(NamespaceInner {
                trie: PathTrie::new(),
                cache: ResolveCache::new(cache_capacity),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, NamespaceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of owned paths.
    pub fn len(&self) -> usize {
        self.inner().trie.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached resolutions.
    pub fn cached(&self) -> usize {
        self.inner().cache.len()
    }

    /// Maps `path` to `owner`.
    pub fn insert(&self, path: &str, owner: ServerId) -> Result<(), NetFsError> {
        let norm = normalize_path(path)?;
        let mut inner = self.inner();
        inner.trie.insert(&norm, owner)?;
        inner.cache.invalidate(&norm);
        Ok(())
    }

    /// Resolves the owner of exactly `path`, consulting the cache first and
    /// populating it from the trie on a miss.
    pub fn resolve(&self, path: &str) -> Result<Option<ServerId>, NetFsError> {
        let norm = normalize_path(path)?;
        let mut inner = self.inner();
        if let Some(owner) = inner.cache.get(&norm) {
            return Ok(Some(owner));
        }
        let owner = inner.trie.resolve(&norm);
        if let Some(owner) = owner {
            inner.cache.put(&norm, owner);
        }
        Ok(owner)
    }

    pub fn contains(&self, path: &str) -> Result<bool, NetFsError> {
        let norm = normalize_path(path)?;
        Ok(self.inner().trie.contains(&norm))
    }

    /// Drops `path` and everything below it. Returns whether anything was
    /// removed.
    pub fn delete(&self, path: &str) -> Result<bool, NetFsError> {
        let norm = normalize_path(path)?;
        let mut inner = self.inner();
        inner.cache.invalidate_prefix(&norm);
        Ok(inner.trie.delete(&norm))
    }

    /// Duplicates the mappings at and below `from` under `to`, keeping their
    /// owners. Returns the number of paths added.
    pub fn copy_subtree(&self, from: &str, to: &str) -> Result<usize, NetFsError> {
        let (from, to) = (normalize_path(from)?, normalize_path(to)?);
        let mut inner = self.inner();
        let entries = inner.trie.owned_under(&from);
        inner.cache.invalidate_prefix(&to);
        for (path, owner) in &entries {
            if let Some(dest) = rebase_path(path, &from, &to) {
                inner.trie.insert(&dest, *owner)?;
            }
        }
        Ok(entries.len())
    }

    /// Re-hangs the mappings at and below `from` under `to`. Returns the
    /// number of paths moved.
    pub fn move_subtree(&self, from: &str, to: &str) -> Result<usize, NetFsError> {
        let (from, to) = (normalize_path(from)?, normalize_path(to)?);
        let mut inner = self.inner();
        let entries = inner.trie.owned_under(&from);
        inner.trie.delete(&from);
        inner.cache.invalidate_prefix(&from);
        inner.cache.invalidate_prefix(&to);
        for (path, owner) in &entries {
            if let Some(dest) = rebase_path(path, &from, &to) {
                inner.trie.insert(&dest, *owner)?;
            }
        }
        Ok(entries.len())
    }

    /// Drops every mapping owned by `server`. Returns the number dropped.
    pub fn drop_owner(&self, server: ServerId) -> usize {
        let mut inner = self.inner();
        inner.cache.invalidate_value(|&owner| owner == server);
        inner.trie.retain_owners(|&owner| owner != server)
    }

    /// Drops every cached resolution pointing at `server`, leaving the trie
    /// untouched. Returns the number of cache entries dropped.
    pub fn invalidate_owner(&self, server: ServerId) -> usize {
        self.inner().cache.invalidate_value(|&owner| owner == server)
    }

    /// Renders the subtree rooted at `path`; `None` if no such node.
    pub fn print_subtree(&self, path: &str) -> Result<Option<String>, NetFsError> {
        let norm = normalize_path(path)?;
        Ok(self.inner().trie.print_subtree(&norm))
    }
}

#[cfg(test)]
mod namespace_tests {
    use super::*;

    #[test]
    fn cache_never_stale() -> Result<(), NetFsError> {
        let ns = Namespace::new(16);
        ns.insert("/a/b", 1)?;
        ns.insert("/a/b/c", 1)?;
        assert_eq!(ns.resolve("/a/b")?, Some(1));
        assert_eq!(ns.resolve("a/b/c")?, Some(1));
        assert_eq!(ns.cached(), 2);

        ns.delete("/a/b")?;
        assert_eq!(ns.resolve("/a/b")?, None);
        assert_eq!(ns.resolve("/a/b/c")?, None);

        ns.insert("/a/b", 2)?;
        assert_eq!(ns.resolve("/a/b")?, Some(2));
        ns.insert("/a/b", 3)?;
        assert_eq!(ns.resolve("/a/b")?, Some(3));
        Ok(())
    }

    #[test]
    fn move_and_copy() -> Result<(), NetFsError> {
        let ns = Namespace::new(16);
        ns.insert("/d", 4)?;
        ns.insert("/d/x", 4)?;
        ns.insert("/d/y/z", 4)?;
        assert_eq!(ns.resolve("/d/x")?, Some(4));

        assert_eq!(ns.copy_subtree("/d", "/e")?, 3);
        assert_eq!(ns.resolve("/e/y/z")?, Some(4));
        assert_eq!(ns.resolve("/d/y/z")?, Some(4));

        assert_eq!(ns.move_subtree("/d", "/f/g")?, 3);
        assert_eq!(ns.resolve("/d/x")?, None);
        assert_eq!(ns.resolve("/f/g/x")?, Some(4));
        assert_eq!(ns.len(), 6);
        Ok(())
    }

    #[test]
    fn owner_removal() -> Result<(), NetFsError> {
        let ns = Namespace::new(16);
        ns.insert("/p", 1)?;
        ns.insert("/q", 2)?;
        assert_eq!(ns.resolve("/p")?, Some(1));
        assert_eq!(ns.invalidate_owner(1), 1);
        assert_eq!(ns.resolve("/p")?, Some(1));

        assert_eq!(ns.drop_owner(1), 1);
        assert_eq!(ns.resolve("/p")?, None);
        assert_eq!(ns.resolve("/q")?, Some(2));
        assert!(ns.print_subtree("/p")?.is_none());
        assert!(ns.print_subtree("/")?.is_some_and(|s| s.contains("|-q (2)")));
        Ok(())
    }
}

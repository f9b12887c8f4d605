//! Path trie mapping hierarchical paths to owners.
//!
//! The naming server keeps one trie mapping every exposed path to the ID of
//! the storage server that owns it; every storage server keeps one mapping
//! its local paths to their reader-writer locks. Children of a node are kept
//! in an ordered map keyed by segment, so sibling segments never collide.

use std::collections::BTreeMap;
use std::fmt;

use crate::namespace::{join_path, path_segments};
use crate::utils::NetFsError;

/// Seed of the djb2 segment hash.
const HASH_SEED: u64 = 5381;

/// djb2 rolling hash (`h = h * 33 + byte`) over a path segment's bytes. Used
/// as a stable bucket tag in diagnostic printouts.
pub fn segment_hash(segment: &str) -> u64 {
    segment.bytes().fold(HASH_SEED, |hash, c| {
        hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(c as u64)
    })
}

#[derive(Debug)]
struct TrieNode<T> {
    /// Path segment owned by this node (empty for the root).
    segment: String,

    /// Child nodes keyed by their segment.
    children: BTreeMap<String, TrieNode<T>>,

    /// Owner of this exact path; `None` for intermediate nodes created on
    /// the way to a deeper insertion.
    owner: Option<T>,
}

impl<T> TrieNode<T> {
    fn new(segment: &str) -> Self {
        TrieNode {
            segment: segment.into(),
            children: BTreeMap::new(),
            owner: None,
        }
    }

    fn owned_count(&self) -> usize {
        self.owner.is_some() as usize
            + self.children.values().map(|c| c.owned_count()).sum::<usize>()
    }
}

/// Path trie, generic over the owner type.
#[derive(Debug)]
pub struct PathTrie<T> {
    root: TrieNode<T>,

    /// Number of nodes carrying an owner.
    len: usize,
}

impl<T: Clone> Default for PathTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> PathTrie<T> {
    /// Creates an empty trie.
    pub fn new() -> Self {
        PathTrie {
            root: TrieNode::new(""),
            len: 0,
        }
    }

    /// Number of owned paths in the trie.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, path: &str) -> Option<&TrieNode<T>> {
        let mut curr = &self.root;
        for segment in path_segments(path).ok()? {
            curr = curr.children.get(segment)?;
        }
        Some(curr)
    }

    /// Sets `owner` on the node for `path`, creating intermediate nodes as
    /// needed. Returns the previous owner of that exact path, if any.
    pub fn insert(
        &mut self,
        path: &str,
        owner: T,
    ) -> Result<Option<T>, NetFsError> {
        let segments = path_segments(path)?;
        if segments.is_empty() {
            return Err(NetFsError::msg("cannot insert the namespace root"));
        }

        let mut curr = &mut self.root;
        for segment in segments {
            curr = curr
                .children
                .entry(segment.to_string())
                .or_insert_with(|| TrieNode::new(segment));
        }

        let old = curr.owner.replace(owner);
        if old.is_none() {
            self.len += 1;
        }
        Ok(old)
    }

    /// Returns the owner of exactly `path`, or `None` if the path was never
    /// inserted (or has been deleted).
    pub fn resolve(&self, path: &str) -> Option<T> {
        self.node(path).and_then(|node| node.owner.clone())
    }

    /// Returns whether `path` is owned in the trie.
    pub fn contains(&self, path: &str) -> bool {
        self.resolve(path).is_some()
    }

    /// Detaches the node for `path` from its parent, dropping the whole
    /// subtree. Returns `false` if there is no such node. The root cannot be
    /// deleted.
    pub fn delete(&mut self, path: &str) -> bool {
        let segments = match path_segments(path) {
            Ok(segments) if !segments.is_empty() => segments,
            _ => return false,
        };
        let (last, parents) = match segments.split_last() {
            Some(split) => split,
            None => return false,
        };

        let mut curr = &mut self.root;
        for segment in parents {
            curr = match curr.children.get_mut(*segment) {
                Some(child) => child,
                None => return false,
            };
        }

        match curr.children.remove(*last) {
            Some(subtree) => {
                self.len -= subtree.owned_count();
                true
            }
            None => false,
        }
    }

    /// Returns `(path, owner)` of every owned node at or below `path`, in
    /// depth-first order with siblings sorted by segment.
    pub fn owned_under(&self, path: &str) -> Vec<(String, T)> {
        fn collect<T: Clone>(
            node: &TrieNode<T>,
            path: String,
            out: &mut Vec<(String, T)>,
        ) {
            if let Some(owner) = &node.owner {
                out.push((path.clone(), owner.clone()));
            }
            for (segment, child) in &node.children {
                collect(child, join_path(&path, segment), out);
            }
        }

        let mut out = Vec::new();
        if let (Some(node), Ok(segments)) = (self.node(path), path_segments(path))
        {
            collect(node, segments.join("/"), &mut out);
        }
        out
    }

    /// Returns all owned paths in the trie, depth-first and sorted.
    pub fn paths(&self) -> Vec<String> {
        self.owned_under("")
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    /// Clears the owner of every node whose owner fails `keep`, then prunes
    /// owner-less leaves. Returns the number of owners cleared.
    pub fn retain_owners<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        fn sweep<T, F: FnMut(&T) -> bool>(
            node: &mut TrieNode<T>,
            keep: &mut F,
        ) -> usize {
            let mut cleared = 0;
            if node.owner.as_ref().is_some_and(|owner| !keep(owner)) {
                node.owner = None;
                cleared += 1;
            }
            for child in node.children.values_mut() {
                cleared += sweep(child, keep);
            }
            node.children
                .retain(|_, child| child.owner.is_some() || !child.children.is_empty());
            cleared
        }

        let cleared = sweep(&mut self.root, &mut keep);
        self.len -= cleared;
        cleared
    }
}

impl<T: Clone + fmt::Display> PathTrie<T> {
    /// Renders the subtree rooted at `path` as an indented tree, one line per
    /// node: `|-segment (owner) #bucket`. Returns `None` if there is no such
    /// node.
    pub fn print_subtree(&self, path: &str) -> Option<String> {
        fn render<T: fmt::Display>(
            node: &TrieNode<T>,
            level: usize,
            out: &mut String,
        ) {
            let label = if node.segment.is_empty() {
                "/"
            } else {
                node.segment.as_str()
            };
            let owner = match &node.owner {
                Some(owner) => owner.to_string(),
                None => "-".into(),
            };
            out.push_str(&"| ".repeat(level));
            out.push_str(&format!(
                "|-{} ({}) #{}\n",
                label,
                owner,
                segment_hash(&node.segment) % 1024
            ));
            for child in node.children.values() {
                render(child, level + 1, out);
            }
        }

        let node = self.node(path)?;
        let mut out = String::new();
        render(node, 0, &mut out);
        Some(out)
    }
}

#[cfg(test)]
mod trie_tests {
    use super::*;

    #[test]
    fn djb2_hash() {
        assert_eq!(segment_hash(""), 5381);
        // 5381 * 33 + 'a'
        assert_eq!(segment_hash("a"), 5381 * 33 + 97);
        assert_ne!(segment_hash("docs"), segment_hash("media"));
    }

    #[test]
    fn insert_resolve_round_trip() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        let paths = [
            ("/docs", 1),
            ("/docs/readme.txt", 1),
            ("/docs/guide/intro.md", 2),
            ("/media/song.mp3", 3),
            ("./notes.txt", 4),
        ];
        for (path, owner) in paths {
            assert_eq!(trie.insert(path, owner)?, None);
        }
        for (path, owner) in paths {
            assert_eq!(trie.resolve(path), Some(owner));
        }
        assert_eq!(trie.len(), paths.len());

        // never inserted, including implicitly created intermediate nodes
        assert_eq!(trie.resolve("/docs/missing.txt"), None);
        assert_eq!(trie.resolve("/media"), None);
        assert_eq!(trie.resolve("/docs/guide"), None);
        assert_eq!(trie.resolve("/nowhere/at/all"), None);
        Ok(())
    }

    #[test]
    fn sibling_segments_never_collide() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        for i in 0..500 {
            trie.insert(&format!("/dir/file{}", i), i)?;
        }
        for i in 0..500 {
            assert_eq!(trie.resolve(&format!("dir/file{}", i)), Some(i));
        }
        Ok(())
    }

    #[test]
    fn insert_overwrites_owner() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        trie.insert("/a", 1)?;
        assert_eq!(trie.insert("/a", 2)?, Some(1));
        assert_eq!(trie.resolve("/a"), Some(2));
        assert_eq!(trie.len(), 1);
        assert!(trie.insert("/", 3).is_err());
        Ok(())
    }

    #[test]
    fn delete_removes_subtree() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        trie.insert("/a", 7)?;
        trie.insert("/a/b/c", 9)?;
        trie.insert("/a/b", 9)?;
        assert!(trie.delete("/a/b"));
        assert_eq!(trie.resolve("/a/b/c"), None);
        assert_eq!(trie.resolve("/a/b"), None);
        assert_eq!(trie.resolve("/a"), Some(7));
        assert_eq!(trie.len(), 1);
        assert!(!trie.delete("/a/b"));
        assert!(!trie.delete("/"));
        Ok(())
    }

    #[test]
    fn owned_under_in_order() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        trie.insert("/d", 0)?;
        trie.insert("/d/z.txt", 1)?;
        trie.insert("/d/a.txt", 2)?;
        trie.insert("/e", 3)?;
        assert_eq!(
            trie.owned_under("/d"),
            vec![
                ("d".to_string(), 0),
                ("d/a.txt".to_string(), 2),
                ("d/z.txt".to_string(), 1)
            ]
        );
        assert_eq!(trie.paths(), vec!["d", "d/a.txt", "d/z.txt", "e"]);
        assert!(trie.owned_under("/nope").is_empty());
        Ok(())
    }

    #[test]
    fn retain_prunes_cleared() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        trie.insert("/x/y/z", 1)?;
        trie.insert("/x", 2)?;
        trie.insert("/w/v", 1)?;
        assert_eq!(trie.retain_owners(|&owner| owner != 1), 2);
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.resolve("/x"), Some(2));
        assert_eq!(trie.print_subtree("/w"), None);
        assert_eq!(trie.print_subtree("/x/y"), None);
        Ok(())
    }

    #[test]
    fn print_subtree_layout() -> Result<(), NetFsError> {
        let mut trie = PathTrie::new();
        trie.insert("/docs", 1)?;
        trie.insert("/docs/a.txt", 1)?;
        trie.insert("/docs/sub/b.txt", 2)?;
        let tree = trie.print_subtree("/docs").unwrap();
        let lines: Vec<&str> = tree.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("|-docs (1)"));
        assert!(lines[1].starts_with("| |-a.txt (1)"));
        assert!(lines[2].starts_with("| |-sub (-)"));
        assert!(lines[3].starts_with("| | |-b.txt (2)"));
        assert!(trie.print_subtree("/").unwrap().starts_with("|-/ (-)"));
        Ok(())
    }
}

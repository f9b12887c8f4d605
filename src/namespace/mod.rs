//! Hierarchical path namespace: path normalization helpers, the path trie,
//! and the bounded path resolution cache.

mod cache;
mod trie;

pub use cache::ResolveCache;
pub use trie::{segment_hash, PathTrie};

use crate::utils::NetFsError;

/// Splits a path into its segments. Empty segments and `.` segments are
/// dropped, so `/docs/a.txt`, `./docs/a.txt` and `docs/a.txt` all name the
/// same entry (a leading `.` being a storage server's local mount prefix).
/// `..` segments are rejected.
pub fn path_segments(path: &str) -> Result<Vec<&str>, NetFsError> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(NetFsError(format!(
                    "parent segment not allowed in path '{}'",
                    path
                )))
            }
            s => segments.push(s),
        }
    }
    Ok(segments)
}

/// Returns the normalized form `seg/seg/...` of a path. The namespace root
/// normalizes to an empty string.
pub fn normalize_path(path: &str) -> Result<String, NetFsError> {
    Ok(path_segments(path)?.join("/"))
}

/// Splits a normalized path into its parent path and last segment. Returns
/// `None` for the namespace root.
pub fn split_parent(norm: &str) -> Option<(&str, &str)> {
    if norm.is_empty() {
        None
    } else {
        Some(norm.rsplit_once('/').unwrap_or(("", norm)))
    }
}

/// Joins a normalized parent path and a child segment.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Returns whether normalized path `path` equals `prefix` or lies under it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix)
            && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Maps a normalized path lying under `from` to the corresponding path under
/// `to`. Returns `None` if `path` is not within `from`.
pub fn rebase_path(path: &str, from: &str, to: &str) -> Option<String> {
    if !is_within(path, from) {
        return None;
    }
    let rest = path[from.len()..].trim_start_matches('/');
    if rest.is_empty() {
        Some(to.to_string())
    } else {
        Some(join_path(to, rest))
    }
}

#[cfg(test)]
mod path_tests {
    use super::*;

    #[test]
    fn normalize_variants() -> Result<(), NetFsError> {
        assert_eq!(normalize_path("/docs/readme.txt")?, "docs/readme.txt");
        assert_eq!(normalize_path("./docs/readme.txt")?, "docs/readme.txt");
        assert_eq!(normalize_path("docs//readme.txt/")?, "docs/readme.txt");
        assert_eq!(normalize_path("/")?, "");
        assert!(normalize_path("/docs/../etc").is_err());
        Ok(())
    }

    #[test]
    fn parent_split() {
        assert_eq!(split_parent("a/b/c"), Some(("a/b", "c")));
        assert_eq!(split_parent("a"), Some(("", "a")));
        assert_eq!(split_parent(""), None);
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a/b", "c"), "a/b/c");
    }

    #[test]
    fn within_and_rebase() {
        assert!(is_within("a/b/c", "a/b"));
        assert!(is_within("a/b", "a/b"));
        assert!(!is_within("a/bc", "a/b"));
        assert!(is_within("anything", ""));
        assert_eq!(rebase_path("a/b/c", "a/b", "x"), Some("x/c".into()));
        assert_eq!(rebase_path("a/b", "a/b", "x/y"), Some("x/y".into()));
        assert_eq!(rebase_path("a/bc", "a/b", "x"), None);
    }
}

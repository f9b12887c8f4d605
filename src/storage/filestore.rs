//! Storage server's local file store: the files under the server's root
//! directory together with the trie of per-path locks guarding them.
//!
//! Methods here only keep the disk and the lock trie consistent with each
//! other; callers take the per-path locks around them.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::UNIX_EPOCH;

use crate::namespace::{
    is_within, normalize_path, rebase_path, split_parent, PathTrie,
};
use crate::protocol::{ErrorCode, Response, BACKUP_DIR};
use crate::storage::FairRwLock;
use crate::utils::NetFsError;

use tokio::fs::{self, File, OpenOptions};

/// Failure of a storage operation, carrying the wire error code it maps to.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct OpError {
    pub code: ErrorCode,
    pub reason: String,
}

impl OpError {
    pub fn new(code: ErrorCode, reason: impl ToString) -> Self {
        OpError {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ErrorCode::PathNotFound, format!("'{}' not found", path))
    }
}

impl From<io::Error> for OpError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::PathNotFound,
            io::ErrorKind::AlreadyExists => ErrorCode::PathExists,
            _ => ErrorCode::IoFailure,
        };
        OpError::new(code, e)
    }
}

impl From<NetFsError> for OpError {
    fn from(e: NetFsError) -> Self {
        OpError::new(ErrorCode::IoFailure, e)
    }
}

impl From<OpError> for Response {
    fn from(e: OpError) -> Self {
        Response::failure(e.code, e.reason)
    }
}

pub type OpResult<T> = Result<T, OpError>;

/// Normalizes a client-supplied path, mapping failure to `InvalidPath`.
pub fn normalize(path: &str) -> OpResult<String> {
    normalize_path(path).map_err(|e| OpError::new(ErrorCode::InvalidPath, e))
}

/// Whether normalized `path` lies in the replica area.
pub fn is_replica_path(path: &str) -> bool {
    !path.is_empty() && is_within(path, BACKUP_DIR)
}

/// Local file store rooted at a directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,

    /// Map from normalized path -> its reader-writer lock.
    locks: RwLock<PathTrie<Arc<FairRwLock>>>,
}

impl FileStore {
    /// Opens the store at `root`, creating it if needed, and registers every
    /// entry at or below each of `mount_paths` as well as any replicas kept
    /// from earlier runs. Returns the store and the mount paths that do not
    /// exist on disk.
    pub async fn new_and_populate(
        root: &Path,
        mount_paths: &[String],
    ) -> Result<(Self, Vec<String>), NetFsError> {
        fs::create_dir_all(root.join(BACKUP_DIR)).await?;
        let store = FileStore {
            root: root.to_path_buf(),
            locks: RwLock::new(PathTrie::new()),
        };

        let mut missing = Vec::new();
        for mount in mount_paths {
            let norm = normalize_path(mount)?;
            if is_replica_path(&norm) {
                return Err(NetFsError(format!(
                    "mount path '{}' overlaps the replica area",
                    mount
                )));
            }
            if fs::metadata(store.local_path(&norm)).await.is_err() {
                missing.push(mount.clone());
                continue;
            }
            store.register_tree(&norm).await?;
        }
        store.register_tree(BACKUP_DIR).await?;
        Ok((store, missing))
    }

    fn trie_read(&self) -> RwLockReadGuard<'_, PathTrie<Arc<FairRwLock>>> {
        self.locks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn trie_write(&self) -> RwLockWriteGuard<'_, PathTrie<Arc<FairRwLock>>> {
        self.locks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a fresh lock for `path` unless it already has one.
    fn register(&self, path: &str) -> Result<(), NetFsError> {
        let mut trie = self.trie_write();
        if !trie.contains(path) {
            trie.insert(path, Arc::new(FairRwLock::new()))?;
        }
        Ok(())
    }

    /// Registers `path` (unless it is the root) and everything below it on
    /// disk, breadth first.
    async fn register_tree(&self, path: &str) -> Result<(), NetFsError> {
        let mut queue = VecDeque::from([path.to_string()]);
        while let Some(path) = queue.pop_front() {
            // the replica area root itself is not an entry
            if !path.is_empty() && path != BACKUP_DIR {
                self.register(&path)?;
            }
            if !fs::metadata(self.local_path(&path)).await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(self.local_path(&path)).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = normalize_path(&format!("{}/{}", path, name))?;
                if path.is_empty() && child == BACKUP_DIR {
                    continue;
                }
                queue.push_back(child);
            }
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location on disk of normalized `path`.
    pub fn local_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.trie_read().contains(path)
    }

    /// Every registered path outside the replica area, sorted depth first.
    pub fn exposed_paths(&self) -> Vec<String> {
        self.trie_read()
            .paths()
            .into_iter()
            .filter(|path| !is_replica_path(path))
            .collect()
    }

    /// Lock of exactly `path`.
    pub fn lock_of(&self, path: &str) -> OpResult<Arc<FairRwLock>> {
        self.trie_read()
            .resolve(path)
            .ok_or_else(|| OpError::not_found(path))
    }

    /// Locks of `path` and everything below it, in depth-first order with
    /// siblings sorted. Taking multiple locks in this order never deadlocks
    /// against another task doing the same.
    pub fn locks_under(&self, path: &str) -> Vec<(String, Arc<FairRwLock>)> {
        self.trie_read().owned_under(path)
    }

    pub async fn is_dir(&self, path: &str) -> OpResult<bool> {
        Ok(fs::metadata(self.local_path(path)).await?.is_dir())
    }

    /// Fails unless the parent of `path` is an existing directory.
    async fn check_parent(&self, path: &str) -> OpResult<()> {
        let parent = match split_parent(path) {
            Some((parent, _)) => parent,
            None => {
                return Err(OpError::new(
                    ErrorCode::InvalidPath,
                    "the root cannot be a target",
                ))
            }
        };
        match fs::metadata(self.local_path(parent)).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' is not a directory", parent),
            )),
            Err(_) => Err(OpError::not_found(parent)),
        }
    }

    /// Fails with `PathExists` if `path` is registered or anything, exposed
    /// or not, already sits at its local location.
    async fn check_absent(&self, path: &str) -> OpResult<()> {
        if self.contains(path)
            || fs::symlink_metadata(self.local_path(path)).await.is_ok()
        {
            Err(OpError::new(
                ErrorCode::PathExists,
                format!("'{}' already exists", path),
            ))
        } else {
            Ok(())
        }
    }

    /// Creates an empty file, or a directory if `dir` is set.
    pub async fn create(&self, path: &str, dir: bool) -> OpResult<()> {
        self.check_absent(path).await?;
        self.check_parent(path).await?;
        let local = self.local_path(path);
        if dir {
            fs::create_dir(&local).await?;
        } else {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&local)
                .await?;
        }
        self.register(path)?;
        Ok(())
    }

    /// Deletes the file or directory tree at `path`.
    pub async fn delete(&self, path: &str) -> OpResult<()> {
        if !self.contains(path) {
            return Err(OpError::not_found(path));
        }
        let local = self.local_path(path);
        if fs::metadata(&local).await?.is_dir() {
            fs::remove_dir_all(&local).await?;
        } else {
            fs::remove_file(&local).await?;
        }
        self.trie_write().delete(path);
        Ok(())
    }

    /// Human-readable metadata summary of `path`.
    pub async fn info(&self, path: &str) -> OpResult<String> {
        if !self.contains(path) {
            return Err(OpError::not_found(path));
        }
        let meta = fs::metadata(self.local_path(path)).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Ok(format!(
            "{}, {} bytes, {}, modified at {}",
            if meta.is_dir() { "directory" } else { "file" },
            meta.len(),
            if meta.permissions().readonly() {
                "read-only"
            } else {
                "read-write"
            },
            modified
        ))
    }

    /// Copies the file or directory tree at `from` to `to`.
    pub async fn copy(&self, from: &str, to: &str) -> OpResult<()> {
        if !self.contains(from) {
            return Err(OpError::not_found(from));
        }
        self.check_absent(to).await?;
        self.check_parent(to).await?;

        let mut stack = vec![(self.local_path(from), self.local_path(to))];
        while let Some((src, dst)) = stack.pop() {
            if fs::metadata(&src).await?.is_dir() {
                fs::create_dir(&dst).await?;
                let mut entries = fs::read_dir(&src).await?;
                while let Some(entry) = entries.next_entry().await? {
                    stack.push((entry.path(), dst.join(entry.file_name())));
                }
            } else {
                fs::copy(&src, &dst).await?;
            }
        }

        let copied = self.locks_under(from);
        let mut trie = self.trie_write();
        for (path, _) in copied {
            if let Some(dest) = rebase_path(&path, from, to) {
                trie.insert(&dest, Arc::new(FairRwLock::new()))?;
            }
        }
        Ok(())
    }

    /// Moves the file or directory tree at `from` to `to`. Locks move along
    /// with their paths.
    pub async fn rename(&self, from: &str, to: &str) -> OpResult<()> {
        if !self.contains(from) {
            return Err(OpError::not_found(from));
        }
        if is_within(to, from) {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' lies inside '{}'", to, from),
            ));
        }
        self.check_absent(to).await?;
        self.check_parent(to).await?;
        fs::rename(self.local_path(from), self.local_path(to)).await?;

        let mut trie = self.trie_write();
        let moved = trie.owned_under(from);
        trie.delete(from);
        for (path, lock) in moved {
            if let Some(dest) = rebase_path(&path, from, to) {
                trie.insert(&dest, lock)?;
            }
        }
        Ok(())
    }

    /// Opens the file at `path` for reading.
    pub async fn open_read(&self, path: &str) -> OpResult<File> {
        if !self.contains(path) {
            return Err(OpError::not_found(path));
        }
        if self.is_dir(path).await? {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' is a directory", path),
            ));
        }
        Ok(File::open(self.local_path(path)).await?)
    }

    /// Opens the file at `path` for writing, truncating it unless `append`.
    pub async fn open_write(&self, path: &str, append: bool) -> OpResult<File> {
        if !self.contains(path) {
            return Err(OpError::not_found(path));
        }
        if self.is_dir(path).await? {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' is a directory", path),
            ));
        }
        Ok(OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .open(self.local_path(path))
            .await?)
    }

    /// Makes sure replica `path` exists, creating it and any missing parent
    /// directories. Existing files are left as they are.
    pub async fn ensure_replica(&self, path: &str, dir: bool) -> OpResult<()> {
        if !is_replica_path(path) || path == BACKUP_DIR {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' is outside the replica area", path),
            ));
        }
        let local = self.local_path(path);
        if dir {
            fs::create_dir_all(&local).await?;
        } else {
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .write(true)
                .create(true)
                .open(&local)
                .await?;
        }

        // register every ancestor inside the replica area as well
        let mut curr = path;
        while curr != BACKUP_DIR {
            self.register(curr)?;
            curr = match split_parent(curr) {
                Some((parent, _)) => parent,
                None => break,
            };
        }
        Ok(())
    }

    /// Removes replica `path` if present.
    pub async fn remove_replica(&self, path: &str) -> OpResult<()> {
        if !is_replica_path(path) || path == BACKUP_DIR {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' is outside the replica area", path),
            ));
        }
        match self.delete(path).await {
            Err(e) if e.code == ErrorCode::PathNotFound => Ok(()),
            res => res,
        }
    }
}

#[cfg(test)]
mod filestore_tests {
    use super::*;

    async fn fresh_root(name: &str) -> Result<PathBuf, NetFsError> {
        let root = std::env::temp_dir().join(format!("netfs-{}", name));
        if fs::metadata(&root).await.is_ok() {
            fs::remove_dir_all(&root).await?;
        }
        fs::create_dir_all(root.join("docs/guide")).await?;
        fs::write(root.join("docs/readme.txt"), b"read me").await?;
        fs::write(root.join("docs/guide/intro.md"), b"intro").await?;
        fs::write(root.join("hidden.txt"), b"hidden").await?;
        Ok(root)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn populate_exposes_mounts() -> Result<(), NetFsError> {
        let root = fresh_root("populate").await?;
        let (store, missing) =
            FileStore::new_and_populate(&root, &["./docs".into(), "nope".into()])
                .await?;
        assert_eq!(missing, vec!["nope".to_string()]);
        assert_eq!(
            store.exposed_paths(),
            vec![
                "docs",
                "docs/guide",
                "docs/guide/intro.md",
                "docs/readme.txt"
            ]
        );
        assert!(!store.contains("hidden.txt"));
        assert!(store.lock_of("docs/readme.txt").is_ok());
        assert_eq!(
            store.lock_of("hidden.txt").unwrap_err().code,
            ErrorCode::PathNotFound
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_delete_info() -> Result<(), NetFsError> {
        let root = fresh_root("create").await?;
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;

        store.create("docs/new.txt", false).await.unwrap();
        assert!(store.contains("docs/new.txt"));
        assert_eq!(
            store.create("docs/new.txt", false).await.unwrap_err().code,
            ErrorCode::PathExists
        );
        assert_eq!(
            store.create("nodir/x", false).await.unwrap_err().code,
            ErrorCode::PathNotFound
        );
        store.create("docs/sub", true).await.unwrap();
        assert!(store.is_dir("docs/sub").await.unwrap());

        let info = store.info("docs/readme.txt").await.unwrap();
        assert!(info.starts_with("file, 7 bytes"));

        store.delete("docs/guide").await.unwrap();
        assert!(!store.contains("docs/guide/intro.md"));
        assert!(fs::metadata(root.join("docs/guide")).await.is_err());
        assert_eq!(
            store.delete("docs/guide").await.unwrap_err().code,
            ErrorCode::PathNotFound
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn copy_and_rename() -> Result<(), NetFsError> {
        let root = fresh_root("copy").await?;
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;

        store.copy("docs/guide", "docs/guide2").await.unwrap();
        assert!(store.contains("docs/guide2/intro.md"));
        assert_eq!(
            fs::read(root.join("docs/guide2/intro.md")).await?,
            b"intro"
        );

        let lock = store.lock_of("docs/readme.txt").unwrap();
        store.rename("docs/readme.txt", "docs/README").await.unwrap();
        assert!(!store.contains("docs/readme.txt"));
        assert!(Arc::ptr_eq(&lock, &store.lock_of("docs/README").unwrap()));
        assert_eq!(
            store.rename("docs", "docs/inner").await.unwrap_err().code,
            ErrorCode::InvalidOperation
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unexposed_destination_kept() -> Result<(), NetFsError> {
        let root = fresh_root("unexposed").await?;
        fs::write(root.join("secret.txt"), b"precious").await?;
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;
        assert!(!store.contains("secret.txt"));

        assert_eq!(
            store
                .rename("docs/readme.txt", "secret.txt")
                .await
                .unwrap_err()
                .code,
            ErrorCode::PathExists
        );
        assert_eq!(
            store.copy("docs/guide", "hidden.txt").await.unwrap_err().code,
            ErrorCode::PathExists
        );
        assert_eq!(
            store.create("secret.txt", false).await.unwrap_err().code,
            ErrorCode::PathExists
        );
        assert_eq!(fs::read(root.join("secret.txt")).await?, b"precious");
        assert_eq!(fs::read(root.join("hidden.txt")).await?, b"hidden");
        assert!(store.contains("docs/readme.txt"));
        assert_eq!(fs::read(root.join("docs/readme.txt")).await?, b"read me");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replica_area() -> Result<(), NetFsError> {
        let root = fresh_root("replica").await?;
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;

        store.ensure_replica("backup/docs/a/b.txt", false).await.unwrap();
        assert!(store.contains("backup/docs/a/b.txt"));
        assert!(store.contains("backup/docs/a"));
        assert!(!store.contains("backup"));
        assert!(!store.exposed_paths().iter().any(|p| p.starts_with("backup")));
        assert_eq!(
            store.ensure_replica("docs/x", false).await.unwrap_err().code,
            ErrorCode::InvalidOperation
        );

        store.remove_replica("backup/docs").await.unwrap();
        store.remove_replica("backup/docs").await.unwrap();
        assert!(!store.contains("backup/docs/a/b.txt"));

        // replicas survive a restart
        store.ensure_replica("backup/keep.txt", false).await.unwrap();
        drop(store);
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;
        assert!(store.contains("backup/keep.txt"));
        Ok(())
    }
}

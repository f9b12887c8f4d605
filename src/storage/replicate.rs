//! Write-through replication from a primary storage server to its backups.
//!
//! The primary acts as a client of each backup's client-facing API, pushing
//! changes with the `REPLICA` flag to `./backup/<path>`. Pushes are best
//! effort: failures are logged and never fail the operation that caused
//! them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock};

use crate::client::DataStub;
use crate::protocol::{
    backup_path, ClientId, OpCode, Request, Response, ServerId,
    FLAG_DIRECTORY, FLAG_REPLICA,
};
use crate::storage::filestore::{is_replica_path, FileStore};
use crate::utils::NetFsError;

use futures::future::join_all;

use tokio::fs::File;

/// Client ID carried by replica pushes.
pub const REPLICATOR_CLIENT_ID: ClientId = ClientId::MAX;

/// Replica pusher of one storage server.
#[derive(Debug)]
pub struct Replicator {
    /// Log prefix of the owning server.
    me: String,

    chunk_size: usize,

    /// ID and client-facing address of every current backup.
    backups: RwLock<Vec<(ServerId, SocketAddr)>>,
}

impl Replicator {
    pub fn new(me: String, chunk_size: usize) -> Self {
        Replicator {
            me,
            chunk_size,
            backups: RwLock::new(vec![]),
        }
    }

    /// Replaces the backup set.
    pub fn set_backups(&self, backups: Vec<(ServerId, SocketAddr)>) {
        *self.backups.write().unwrap_or_else(PoisonError::into_inner) = backups;
    }

    pub fn backups(&self) -> Vec<(ServerId, SocketAddr)> {
        self.backups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replica_req(op: OpCode, path: &str) -> Result<Request, NetFsError> {
        Ok(Request::new(op, REPLICATOR_CLIENT_ID, backup_path(path)?)
            .with_flags(FLAG_REPLICA))
    }

    /// Runs `push` against every backup concurrently and logs failures.
    /// Returns the number of backups that acknowledged successfully.
    async fn push_all<F, Fut>(&self, what: &str, path: &str, push: F) -> usize
    where
        F: Fn(SocketAddr) -> Fut,
        Fut: Future<Output = Result<Response, NetFsError>>,
    {
        let backups = self.backups();
        let results =
            join_all(backups.iter().map(|&(_, addr)| push(addr))).await;

        let mut acked = 0;
        for ((id, addr), res) in backups.iter().zip(results) {
            match res {
                Ok(resp) if resp.is_success() => acked += 1,
                Ok(resp) => {
                    pf_warn!(self.me; "{} '{}' -> backup {} '{}' refused: {} {}",
                                      what, path, id, addr,
                                      resp.error_code, resp.data);
                }
                Err(e) => {
                    pf_warn!(self.me; "{} '{}' -> backup {} '{}' failed: {}",
                                      what, path, id, addr, e);
                }
            }
        }
        acked
    }

    /// Pushes the current content of file `path`. The caller must keep the
    /// file from being written meanwhile.
    pub async fn push_file(&self, store: &FileStore, path: &str) -> usize {
        let local = store.local_path(path);
        self.push_all("push file", path, |addr| {
            let local = local.clone();
            async move {
                let req = Self::replica_req(OpCode::Write, path)?;
                let mut file = File::open(&local).await?;
                let mut stub = DataStub::connect(addr, self.chunk_size).await?;
                stub.write(&req, &mut file).await
            }
        })
        .await
    }

    /// Creates directory `path` on the backups.
    pub async fn push_dir(&self, path: &str) -> usize {
        self.push_all("push dir", path, |addr| async move {
            let req = Self::replica_req(OpCode::Create, path)?
                .with_flags(FLAG_DIRECTORY);
            let mut stub = DataStub::connect(addr, self.chunk_size).await?;
            stub.call(&req).await
        })
        .await
    }

    /// Removes `path` and everything below it from the backups.
    pub async fn push_delete(&self, path: &str) -> usize {
        self.push_all("push delete", path, |addr| async move {
            let req = Self::replica_req(OpCode::Delete, path)?;
            let mut stub = DataStub::connect(addr, self.chunk_size).await?;
            stub.call(&req).await
        })
        .await
    }

    /// Pushes `path` and everything below it, taking a read lock on each
    /// file while its content is pushed.
    pub async fn push_subtree(&self, store: &FileStore, path: &str) {
        if self.backups().is_empty() {
            return;
        }
        for (path, lock) in store.locks_under(path) {
            if is_replica_path(&path) {
                continue;
            }
            match store.is_dir(&path).await {
                Ok(true) => {
                    self.push_dir(&path).await;
                }
                Ok(false) => match lock.acquire_read().await {
                    Ok(_guard) => {
                        self.push_file(store, &path).await;
                    }
                    Err(e) => {
                        pf_error!(self.me; "error locking '{}': {}", path, e)
                    }
                },
                // deleted meanwhile
                Err(_) => continue,
            }
        }
    }

    /// Pushes every exposed entry to the backups.
    pub async fn sync_all(&self, store: &FileStore) {
        pf_info!(self.me; "syncing {} paths to backups {:?}",
                          store.exposed_paths().len(), self.backups());
        self.push_subtree(store, "").await;
    }
}

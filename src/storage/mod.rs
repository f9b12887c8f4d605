//! Storage server: holds files under a local root directory, serves data
//! requests from clients, performs namespace mutations forwarded by the
//! naming server, and replicates its files to its backups.

mod control;
mod external;
mod filestore;
mod mediated;
mod replicate;
mod rwlock;

pub use filestore::{FileStore, OpError};
pub use replicate::Replicator;
pub use rwlock::{FairRwLock, ReadGuard, WriteGuard};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::protocol::{CtrlMsg, ServerId};
use crate::utils::{tcp_bind_with_retry, NetFsError, MAX_FRAME_LEN};

use control::ControlHub;
use external::ExternalApi;
use mediated::handle_forwarded;

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Local directory all exposed paths are relative to.
    pub root_dir: String,

    /// Paths under `root_dir` exposed to the namespace.
    pub mount_paths: Vec<String>,

    /// Size of data chunks streamed in READ and WRITE.
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root_dir: "/tmp/netfs/storage".into(),
            mount_paths: vec![".".into()],
            chunk_size: 1024,
        }
    }
}

/// State shared by every task of a storage server.
#[derive(Debug)]
pub(crate) struct StorageContext {
    /// Log prefix.
    pub(crate) me: String,

    pub(crate) store: FileStore,
    pub(crate) replicator: Replicator,
    pub(crate) chunk_size: usize,
}

/// Standalone storage server.
pub struct StorageServer {
    ctx: Arc<StorageContext>,

    /// ControlHub module.
    control_hub: ControlHub,

    /// ExternalApi module.
    external_api: ExternalApi,
}

impl StorageServer {
    /// Creates a new storage server: populates the file store, opens the
    /// client-facing API, then registers with the naming server at
    /// `naming_addr`. Returns once registration is accepted; backups are
    /// assigned later, after the replica barrier opens.
    pub async fn new_and_setup(
        api_addr: SocketAddr,
        ns_bind_addr: Option<SocketAddr>,
        naming_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, NetFsError> {
        let config = parsed_config!(config_str => StorageConfig;
                                    root_dir, mount_paths, chunk_size)?;
        if config.chunk_size == 0 || config.chunk_size > MAX_FRAME_LEN {
            return logged_err!(
                "ss";
                "invalid config.chunk_size '{}'",
                config.chunk_size
            );
        }

        let (store, missing) = FileStore::new_and_populate(
            Path::new(&config.root_dir),
            &config.mount_paths,
        )
        .await?;
        for mount in &missing {
            pf_warn!("ss"; "mount path '{}' does not exist, skipped", mount);
        }

        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;
        let client_port = client_listener.local_addr()?.port();
        let control_hub = ControlHub::new_and_setup(
            ns_bind_addr,
            naming_addr,
            api_addr.ip().to_string(),
            client_port,
            store.exposed_paths(),
        )
        .await?;

        let me = format!("ss{}", control_hub.id);
        let ctx = Arc::new(StorageContext {
            replicator: Replicator::new(me.clone(), config.chunk_size),
            me,
            store,
            chunk_size: config.chunk_size,
        });
        let external_api =
            ExternalApi::new_and_setup(client_listener, ctx.clone())?;
        pf_info!(ctx.me; "serving clients on '{}' from root '{}'",
                         external_api.local_addr, config.root_dir);
        pf_info!(ctx.me; "config {:?}", config);

        Ok(StorageServer {
            ctx,
            control_hub,
            external_api,
        })
    }

    /// ID assigned by the naming server.
    pub fn id(&self) -> ServerId {
        self.control_hub.id
    }

    /// Address the client-facing API listens on.
    pub fn api_addr(&self) -> SocketAddr {
        self.external_api.local_addr
    }

    /// Handles one message from the naming server.
    fn handle_ctrl_msg(&self, msg: CtrlMsg) {
        match msg {
            CtrlMsg::Forward { seq, req } => {
                let ctx = self.ctx.clone();
                let tx_send = self.control_hub.sender();
                tokio::spawn(async move {
                    let resp = handle_forwarded(&ctx, req).await.truncated();
                    if let Err(e) = tx_send.send(CtrlMsg::Reply { seq, resp }) {
                        pf_error!(ctx.me; "error replying to forward {}: {}",
                                          seq, e);
                    }
                });
            }

            CtrlMsg::AssignBackups { backups } => {
                pf_info!(self.ctx.me; "assigned backups {:?}", backups);
                self.ctx.replicator.set_backups(backups);
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    ctx.replicator.sync_all(&ctx.store).await;
                });
            }

            msg => {
                pf_warn!(self.ctx.me; "unexpected ctrl msg {:?}", msg);
            }
        }
    }

    /// Main event loop: serves the naming server link until the link breaks
    /// or the termination signal arrives, in which case the server
    /// deregisters gracefully.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), NetFsError> {
        loop {
            tokio::select! {
                // message from the naming server
                msg = self.control_hub.recv_ctrl() => {
                    let msg = msg?; // link broken
                    self.handle_ctrl_msg(msg);
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.ctx.me; "storage server caught termination signal");
                    let leave = self.control_hub.leave();
                    match time::timeout(Duration::from_secs(5), leave).await {
                        Ok(Ok(())) => {
                            pf_info!(self.ctx.me; "deregistered from naming server");
                        }
                        Ok(Err(e)) => {
                            pf_error!(self.ctx.me; "error deregistering: {}", e);
                        }
                        Err(_) => {
                            pf_error!(self.ctx.me; "timed out deregistering");
                        }
                    }
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod storage_tests {
    use super::*;

    #[test]
    fn config_parsing() -> Result<(), NetFsError> {
        let config = parsed_config!(Some("root_dir = \"/tmp/x\"\nmount_paths = [\"docs\", \"media\"]")
                                    => StorageConfig;
                                    root_dir, mount_paths, chunk_size)?;
        assert_eq!(config.root_dir, "/tmp/x");
        assert_eq!(config.mount_paths, vec!["docs", "media"]);
        assert_eq!(config.chunk_size, StorageConfig::default().chunk_size);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_chunk_size_rejected() {
        assert!(StorageServer::new_and_setup(
            "127.0.0.1:46300".parse().unwrap(),
            None,
            "127.0.0.1:46301".parse().unwrap(),
            Some("chunk_size = 0"),
        )
        .await
        .is_err());
    }
}

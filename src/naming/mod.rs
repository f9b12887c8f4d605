//! Naming server: the namespace authority that resolves paths to storage
//! servers, tracks storage servers and clients, and mediates namespace
//! mutations.

mod clients;
mod handler;
mod namespace;
mod reactor;
mod registry;
mod reigner;

pub use clients::ClientRegistry;
pub use namespace::Namespace;
pub use registry::{ReplicaBarrier, ServerHandle, ServerRegistry};

use std::net::SocketAddr;
use std::sync::Arc;

use crate::utils::NetFsError;

use reactor::ClientReactor;
use reigner::ServerReigner;

use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Log prefix of the naming server.
pub(crate) const NS: &str = "ns";

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// Number of backups per storage server; the replica barrier opens
    /// once this many plus one servers have registered.
    pub backup_servers: usize,

    /// Maximum number of registered storage servers.
    pub max_servers: usize,

    /// Maximum number of concurrent client sessions.
    pub max_clients: usize,

    /// Capacity of the path resolution cache.
    pub cache_capacity: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        NamingConfig {
            backup_servers: 1,
            max_servers: 64,
            max_clients: 1024,
            cache_capacity: 256,
        }
    }
}

/// State shared by every task of the naming server.
#[derive(Debug)]
pub(crate) struct NamingContext {
    pub(crate) namespace: Namespace,
    pub(crate) servers: ServerRegistry,
    pub(crate) clients: ClientRegistry,
}

/// Standalone naming server.
pub struct NamingServer {
    /// Address the storage-server-facing API listens on.
    srv_addr: SocketAddr,

    /// Address the client-facing API listens on.
    cli_addr: SocketAddr,

    /// Shared state.
    ctx: Arc<NamingContext>,

    /// ServerReigner module.
    _server_reigner: ServerReigner,

    /// ClientReactor module.
    _client_reactor: ClientReactor,
}

impl NamingServer {
    /// Creates a new naming server and sets up its functionality modules.
    pub async fn new_and_setup(
        srv_addr: SocketAddr,
        cli_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, NetFsError> {
        let config = parsed_config!(config_str => NamingConfig;
                                    backup_servers, max_servers,
                                    max_clients, cache_capacity)?;
        if config.max_servers <= config.backup_servers {
            return logged_err!(
                NS;
                "invalid config.max_servers '{}' for {} backups",
                config.max_servers,
                config.backup_servers
            );
        }
        if config.max_clients == 0 {
            return logged_err!(
                NS;
                "invalid config.max_clients '{}'",
                config.max_clients
            );
        }

        let ctx = Arc::new(NamingContext {
            namespace: Namespace::new(config.cache_capacity),
            servers: ServerRegistry::new(
                config.backup_servers,
                config.max_servers,
            ),
            clients: ClientRegistry::new(config.max_clients),
        });

        let server_reigner =
            ServerReigner::new_and_setup(srv_addr, ctx.clone()).await?;
        let client_reactor =
            ClientReactor::new_and_setup(cli_addr, ctx.clone()).await?;
        pf_info!(NS; "serving storage servers on '{}', clients on '{}'",
                     server_reigner.local_addr, client_reactor.local_addr);
        pf_info!(NS; "config {:?}", config);

        Ok(NamingServer {
            srv_addr: server_reigner.local_addr,
            cli_addr: client_reactor.local_addr,
            ctx,
            _server_reigner: server_reigner,
            _client_reactor: client_reactor,
        })
    }

    /// Address storage servers register at.
    pub fn srv_addr(&self) -> SocketAddr {
        self.srv_addr
    }

    /// Address clients connect to.
    pub fn cli_addr(&self) -> SocketAddr {
        self.cli_addr
    }

    /// Main event loop: periodically reports status until the termination
    /// signal arrives.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), NetFsError> {
        let mut status_interval = time::interval(Duration::from_secs(10));
        status_interval
            .set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // periodic status report
                _ = status_interval.tick() => {
                    pf_debug!(NS; "status: {} servers ({} active), {} clients, {} paths, {} cached",
                                  self.ctx.servers.len(),
                                  self.ctx.servers.list_active().len(),
                                  self.ctx.clients.len(),
                                  self.ctx.namespace.len(),
                                  self.ctx.namespace.cached());
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(NS; "naming server caught termination signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod naming_tests {
    use super::*;

    #[test]
    fn config_parsing() -> Result<(), NetFsError> {
        let config = parsed_config!(Some("backup_servers = 2\ncache_capacity = 8")
                                    => NamingConfig;
                                    backup_servers, max_servers,
                                    max_clients, cache_capacity)?;
        assert_eq!(config.backup_servers, 2);
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.max_servers, NamingConfig::default().max_servers);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_config_rejected() {
        assert!(NamingServer::new_and_setup(
            "127.0.0.1:46200".parse().unwrap(),
            "127.0.0.1:46201".parse().unwrap(),
            Some("backup_servers = 3\nmax_servers = 3"),
        )
        .await
        .is_err());
        assert!(NamingServer::new_and_setup(
            "127.0.0.1:46200".parse().unwrap(),
            "127.0.0.1:46201".parse().unwrap(),
            Some("no_such_field = 1"),
        )
        .await
        .is_err());
    }
}

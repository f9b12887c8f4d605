//! Naming server's bookkeeping of registered storage servers, their backup
//! assignment, and the startup replica barrier.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{ErrorCode, Request, Response, ServerId};
use crate::utils::NetFsError;

use tokio::sync::{mpsc, oneshot, watch};

/// Command handed to the controller task that owns a storage server's link.
#[derive(Debug)]
pub(crate) enum LinkCmd {
    /// Forward a request to the server and deliver its response.
    Forward {
        req: Request,
        tx_resp: oneshot::Sender<Response>,
    },

    /// Send the current backup assignment to the server.
    PushBackups,
}

/// Information about a registered storage server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub id: ServerId,
    pub ip: IpAddr,
    pub client_port: u16,
    pub ns_port: u16,

    /// Whether the server is currently reachable and serving.
    pub active: bool,

    /// Whether the server's link broke. Lost servers are never picked as
    /// backups again.
    pub lost: bool,

    /// Servers whose data this server mirrors.
    pub backup_of: Vec<ServerId>,

    /// Servers mirroring this server's data.
    pub backups: Vec<ServerId>,

    /// Sender side of the server's link command channel.
    tx_link: mpsc::UnboundedSender<LinkCmd>,
}

impl ServerHandle {
    /// Client-facing address of the server.
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.client_port)
    }

    /// Forwards `req` over the server's link and waits for its response.
    pub(crate) async fn forward(
        &self,
        req: Request,
    ) -> Result<Response, NetFsError> {
        let (tx_resp, rx_resp) = oneshot::channel();
        self.tx_link.send(LinkCmd::Forward { req, tx_resp })?;
        Ok(rx_resp.await?)
    }

    /// Asks the server's controller to resend the backup assignment.
    pub(crate) fn push_backups(&self) -> Result<(), NetFsError> {
        self.tx_link.send(LinkCmd::PushBackups)?;
        Ok(())
    }
}

/// Startup rendezvous: opens once `threshold` servers have registered and
/// stays open from then on.
#[derive(Debug)]
pub struct ReplicaBarrier {
    threshold: usize,
    tx_count: watch::Sender<usize>,
}

impl ReplicaBarrier {
    pub fn new(threshold: usize) -> Self {
        let (tx_count, _) = watch::channel(0);
        ReplicaBarrier {
            threshold,
            tx_count,
        }
    }

    /// Counts one more registration.
    pub fn post(&self) {
        self.tx_count.send_modify(|count| *count += 1);
    }

    pub fn is_open(&self) -> bool {
        *self.tx_count.borrow() >= self.threshold
    }

    /// Waits until the barrier opens.
    pub async fn wait(&self) -> Result<(), NetFsError> {
        let threshold = self.threshold;
        let mut rx_count = self.tx_count.subscribe();
        rx_count
            .wait_for(|count| *count >= threshold)
            .await
            .map_err(|e| NetFsError(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug)]
struct RegistryInner {
    /// Next server ID to assign.
    next_id: ServerId,

    /// Map from server ID -> handle, ordered by ID.
    servers: BTreeMap<ServerId, ServerHandle>,
}

/// Registry of storage servers.
#[derive(Debug)]
pub struct ServerRegistry {
    inner: Mutex<RegistryInner>,

    /// Number of backups each server gets.
    backup_servers: usize,

    /// Maximum number of registered servers.
    max_servers: usize,

    barrier: ReplicaBarrier,
}

impl ServerRegistry {
    /// Creates an empty registry. The barrier opens once
    /// `backup_servers + 1` servers have registered.
    pub fn new(backup_servers: usize, max_servers: usize) -> Self {
        ServerRegistry {
            inner: Mutex::new(RegistryInner {
                next_id: 0,
                servers: BTreeMap::new(),
            }),
            backup_servers,
            max_servers,
            barrier: ReplicaBarrier::new(backup_servers + 1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.inner().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new server in inactive state and posts the barrier.
    /// Fails with `CapacityExceeded` if the registry is full.
    pub(crate) fn register(
        &self,
        ip: IpAddr,
        client_port: u16,
        ns_port: u16,
        tx_link: mpsc::UnboundedSender<LinkCmd>,
    ) -> Result<ServerId, ErrorCode> {
        let id = {
            let mut inner = self.inner();
            if inner.servers.len() >= self.max_servers {
                return Err(ErrorCode::CapacityExceeded);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.servers.insert(
                id,
                ServerHandle {
                    id,
                    ip,
                    client_port,
                    ns_port,
                    active: false,
                    lost: false,
                    backup_of: vec![],
                    backups: vec![],
                    tx_link,
                },
            );
            id
        };
        self.barrier.post();
        Ok(id)
    }

    /// Waits at the startup replica barrier.
    pub async fn wait_barrier(&self) -> Result<(), NetFsError> {
        self.barrier.wait().await
    }

    pub fn barrier_open(&self) -> bool {
        self.barrier.is_open()
    }

    /// Picks the backups of `server`: the next registered servers following
    /// it in ring order of IDs, skipping lost ones, up to the configured
    /// count. Replaces any
    /// previous assignment and keeps `backup_of` symmetric. Returns the
    /// chosen backup IDs.
    pub fn assign_backup_servers(
        &self,
        server: ServerId,
    ) -> Result<Vec<ServerId>, NetFsError> {
        let mut inner = self.inner();
        if !inner.servers.contains_key(&server) {
            return Err(NetFsError(format!("server {} not registered", server)));
        }

        let chosen: Vec<ServerId> = inner
            .servers
            .range(server + 1..)
            .chain(inner.servers.range(..server))
            .filter(|(_, handle)| !handle.lost)
            .map(|(&id, _)| id)
            .take(self.backup_servers)
            .collect();

        let old = match inner.servers.get_mut(&server) {
            Some(handle) => std::mem::replace(&mut handle.backups, chosen.clone()),
            None => vec![],
        };
        for id in old {
            if let Some(backup) = inner.servers.get_mut(&id) {
                backup.backup_of.retain(|&s| s != server);
            }
        }
        for id in &chosen {
            if let Some(backup) = inner.servers.get_mut(id) {
                backup.backup_of.push(server);
            }
        }
        Ok(chosen)
    }

    /// Flips a server to active. Returns `false` if not registered.
    pub fn mark_active(&self, server: ServerId) -> bool {
        match self.inner().servers.get_mut(&server) {
            Some(handle) => {
                handle.active = true;
                true
            }
            None => false,
        }
    }

    /// Flips a server whose link broke to inactive, keeping its handle so
    /// that its paths can still be redirected to a backup. Returns `false`
    /// if not registered.
    pub fn set_inactive(&self, server: ServerId) -> bool {
        match self.inner().servers.get_mut(&server) {
            Some(handle) => {
                handle.active = false;
                handle.lost = true;
                true
            }
            None => false,
        }
    }

    /// Deletes a server's handle and scrubs it from every backup
    /// relationship. Returns the removed handle.
    pub fn remove(&self, server: ServerId) -> Option<ServerHandle> {
        let mut inner = self.inner();
        let removed = inner.servers.remove(&server)?;
        for handle in inner.servers.values_mut() {
            handle.backups.retain(|&s| s != server);
            handle.backup_of.retain(|&s| s != server);
        }
        Some(removed)
    }

    /// Active servers left with a lost backup or fewer backups than
    /// configured.
    pub fn short_of_backups(&self) -> Vec<ServerId> {
        let inner = self.inner();
        inner
            .servers
            .values()
            .filter(|handle| handle.active)
            .filter(|handle| {
                handle.backups.len() < self.backup_servers
                    || handle.backups.iter().any(|id| {
                        inner.servers.get(id).map_or(true, |b| b.lost)
                    })
            })
            .map(|handle| handle.id)
            .collect()
    }

    pub fn get_by_id(&self, server: ServerId) -> Option<ServerHandle> {
        self.inner().servers.get(&server).cloned()
    }

    /// IDs of all active servers, in ascending order.
    pub fn list_active(&self) -> Vec<ServerId> {
        self.inner()
            .servers
            .values()
            .filter(|handle| handle.active)
            .map(|handle| handle.id)
            .collect()
    }

    /// Handle of the lowest-ID active server, if any.
    pub fn first_active(&self) -> Option<ServerHandle> {
        self.inner()
            .servers
            .values()
            .find(|handle| handle.active)
            .cloned()
    }

    /// Handle of the first active backup of `server`, if any.
    pub fn backup_for(&self, server: ServerId) -> Option<ServerHandle> {
        let inner = self.inner();
        inner
            .servers
            .get(&server)?
            .backups
            .iter()
            .filter_map(|id| inner.servers.get(id))
            .find(|handle| handle.active)
            .cloned()
    }

    /// `(id, client address)` of every current backup of `server`.
    pub fn backup_addrs(&self, server: ServerId) -> Vec<(ServerId, SocketAddr)> {
        let inner = self.inner();
        match inner.servers.get(&server) {
            Some(handle) => handle
                .backups
                .iter()
                .filter_map(|id| inner.servers.get(id))
                .map(|backup| (backup.id, backup.client_addr()))
                .collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    fn register(reg: &ServerRegistry, port: u16) -> Result<ServerId, ErrorCode> {
        let (tx_link, _) = mpsc::unbounded_channel();
        reg.register("127.0.0.1".parse().unwrap(), port, port + 1, tx_link)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn barrier_with_two_backups() -> Result<(), NetFsError> {
        let reg = Arc::new(ServerRegistry::new(2, 8));
        let mut waiters = Vec::new();
        for port in [9000, 9010] {
            register(&reg, port).unwrap();
            let reg = reg.clone();
            waiters.push(tokio::spawn(async move { reg.wait_barrier().await }));
        }

        time::sleep(Duration::from_millis(100)).await;
        assert!(!reg.barrier_open());
        assert!(waiters.iter().all(|w| !w.is_finished()));

        register(&reg, 9020).unwrap();
        reg.wait_barrier().await?;
        for waiter in waiters {
            time::timeout(Duration::from_secs(1), waiter).await???;
        }
        assert!(reg.barrier_open());
        Ok(())
    }

    #[test]
    fn capacity_bound() {
        let reg = ServerRegistry::new(0, 2);
        assert_eq!(register(&reg, 9000), Ok(0));
        assert_eq!(register(&reg, 9010), Ok(1));
        assert_eq!(register(&reg, 9020), Err(ErrorCode::CapacityExceeded));
        assert!(reg.remove(0).is_some());
        assert_eq!(register(&reg, 9030), Ok(2));
    }

    #[test]
    fn ring_backup_assignment() -> Result<(), NetFsError> {
        let reg = ServerRegistry::new(2, 8);
        for port in [9000, 9010, 9020, 9030] {
            register(&reg, port).unwrap();
        }
        assert_eq!(reg.assign_backup_servers(0)?, vec![1, 2]);
        assert_eq!(reg.assign_backup_servers(3)?, vec![0, 1]);
        assert_eq!(reg.get_by_id(1).unwrap().backup_of, vec![0, 3]);
        assert!(reg.assign_backup_servers(9).is_err());

        // reassigning keeps backup_of symmetric
        reg.remove(2);
        assert_eq!(reg.assign_backup_servers(0)?, vec![1, 3]);
        assert_eq!(reg.get_by_id(1).unwrap().backup_of, vec![3, 0]);
        assert_eq!(reg.get_by_id(3).unwrap().backup_of, vec![0]);
        assert_eq!(
            reg.backup_addrs(0),
            vec![
                (1, "127.0.0.1:9010".parse().unwrap()),
                (3, "127.0.0.1:9030".parse().unwrap())
            ]
        );
        Ok(())
    }

    #[test]
    fn liveness_and_failover() {
        let reg = ServerRegistry::new(1, 8);
        for port in [9000, 9010] {
            register(&reg, port).unwrap();
        }
        assert!(reg.list_active().is_empty());
        assert!(reg.mark_active(0) && reg.mark_active(1));
        assert_eq!(reg.list_active(), vec![0, 1]);
        reg.assign_backup_servers(0).unwrap();
        assert_eq!(reg.backup_for(0).map(|h| h.id), Some(1));

        assert!(reg.set_inactive(1));
        assert!(reg.backup_for(0).is_none());
        assert!(reg.get_by_id(1).is_some_and(|h| !h.active));
        assert_eq!(reg.first_active().map(|h| h.id), Some(0));
        assert!(!reg.set_inactive(5));
    }

    #[test]
    fn lost_backups_replaced() -> Result<(), NetFsError> {
        let reg = ServerRegistry::new(1, 8);
        for port in [9000, 9010] {
            register(&reg, port).unwrap();
        }
        assert!(reg.mark_active(0) && reg.mark_active(1));
        assert_eq!(reg.assign_backup_servers(0)?, vec![1]);
        assert_eq!(reg.assign_backup_servers(1)?, vec![0]);
        assert!(reg.short_of_backups().is_empty());

        // server 1 breaks and nobody else is left to pick
        assert_eq!(reg.get_by_id(1).unwrap().backup_of, vec![0]);
        assert!(reg.set_inactive(1));
        assert_eq!(reg.short_of_backups(), vec![0]);
        assert!(reg.assign_backup_servers(0)?.is_empty());
        assert_eq!(reg.short_of_backups(), vec![0]);

        // a newcomer fills the gap
        register(&reg, 9020).unwrap();
        assert!(reg.mark_active(2));
        assert_eq!(reg.assign_backup_servers(2)?, vec![0]);
        assert_eq!(reg.short_of_backups(), vec![0]);
        assert_eq!(reg.assign_backup_servers(0)?, vec![2]);
        assert!(reg.short_of_backups().is_empty());
        assert_eq!(reg.backup_for(0).map(|h| h.id), Some(2));

        // the lost server's own paths still redirect to its backup
        assert_eq!(reg.backup_for(1).map(|h| h.id), Some(0));
        Ok(())
    }
}

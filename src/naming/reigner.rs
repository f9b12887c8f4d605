//! Naming server's storage-server-facing module: accepts registrations and
//! runs one controller task per storage server link.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::naming::registry::LinkCmd;
use crate::naming::{NamingContext, NS};
use crate::protocol::{CtrlMsg, ErrorCode, Response, ServerId};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, NetFsError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The storage-server-facing controller module.
pub(crate) struct ServerReigner {
    /// Address the server acceptor listens on.
    pub(crate) local_addr: SocketAddr,

    /// Join handle of the server acceptor thread.
    _server_acceptor_handle: JoinHandle<()>,
}

// ServerReigner public API implementation
impl ServerReigner {
    /// Creates the module and spawns the server acceptor thread.
    pub(crate) async fn new_and_setup(
        srv_addr: SocketAddr,
        ctx: Arc<NamingContext>,
    ) -> Result<Self, NetFsError> {
        let server_listener = tcp_bind_with_retry(srv_addr, 10).await?;
        let local_addr = server_listener.local_addr()?;
        let server_acceptor_handle =
            tokio::spawn(Self::server_acceptor_thread(ctx, server_listener));

        Ok(ServerReigner {
            local_addr,
            _server_acceptor_handle: server_acceptor_handle,
        })
    }
}

// ServerReigner server_acceptor thread implementation
impl ServerReigner {
    /// Server acceptor thread function.
    async fn server_acceptor_thread(
        ctx: Arc<NamingContext>,
        server_listener: TcpListener,
    ) {
        pf_debug!(NS; "server_acceptor thread spawned");

        loop {
            match server_listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(NS; "accepted server connection from '{}'", addr);
                    tokio::spawn(Self::server_controller_thread(
                        ctx.clone(),
                        stream,
                        addr,
                    ));
                }
                Err(e) => {
                    pf_warn!(NS; "error accepting server connection: {}", e);
                }
            }
        }
    }
}

/// How a storage server link ended.
enum LinkEnd {
    /// Server sent `Leave`.
    Graceful,

    /// Connection broke.
    Broken,
}

// ServerReigner server_controller thread implementation
impl ServerReigner {
    /// Sends a control message through given write half.
    async fn write_ctrl(
        conn_write: &mut OwnedWriteHalf,
        msg: &CtrlMsg,
    ) -> Result<(), NetFsError> {
        tcp_write_obj(conn_write, msg).await
    }

    /// Checks the advertised address of a registering server against the
    /// address it connects from. An unspecified advertised IP takes the
    /// peer's IP.
    fn same_origin_ip(
        advertised: &str,
        peer: IpAddr,
    ) -> Result<IpAddr, NetFsError> {
        let ip: IpAddr = advertised.parse()?;
        if ip.is_unspecified() {
            Ok(peer)
        } else if ip == peer {
            Ok(ip)
        } else {
            Err(NetFsError(format!(
                "advertised ip {} differs from peer ip {}",
                ip, peer
            )))
        }
    }

    /// Reads the registration message, registers the server and inserts its
    /// exposed paths into the namespace. Returns the assigned ID.
    async fn handshake(
        ctx: &NamingContext,
        addr: SocketAddr,
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
        conn_write: &mut OwnedWriteHalf,
        tx_link: mpsc::UnboundedSender<LinkCmd>,
    ) -> Result<ServerId, NetFsError> {
        let init = match safe_tcp_read(read_buf, conn_read).await? {
            CtrlMsg::Register(init) => init,
            msg => {
                return Err(NetFsError(format!(
                    "unexpected first msg from '{}': {:?}",
                    addr, msg
                )));
            }
        };

        // check bounds and origin, then take a registry slot
        let checked = init
            .validate()
            .map_err(|e| (ErrorCode::ProtocolError, e))
            .and_then(|_| {
                Self::same_origin_ip(&init.ip, addr.ip())
                    .map_err(|e| (ErrorCode::InvalidOperation, e))
            })
            .and_then(|ip| {
                ctx.servers
                    .register(ip, init.client_port, init.ns_port, tx_link)
                    .map(|id| (id, ip))
                    .map_err(|error_code| {
                        (error_code, NetFsError::msg("server registry is full"))
                    })
            });
        let (id, ip) = match checked {
            Ok(registered) => registered,
            Err((error_code, e)) => {
                let reason = e.to_string();
                let msg = CtrlMsg::Rejected { error_code, reason };
                Self::write_ctrl(conn_write, &msg).await?;
                return Err(e);
            }
        };
        Self::write_ctrl(conn_write, &CtrlMsg::Registered { id }).await?;

        for path in &init.mount_paths {
            if let Err(e) = ctx.namespace.insert(path, id) {
                pf_warn!(NS; "skipping path '{}' of server {}: {}", path, id, e);
            }
        }
        pf_info!(NS; "registered server {} at {}:{} with {} paths",
                     id, ip, init.client_port, init.mount_paths.len());
        Ok(id)
    }

    /// Sends the current backup assignment of `id` to its server.
    async fn send_backups(
        ctx: &NamingContext,
        id: ServerId,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<(), NetFsError> {
        let backups = ctx.servers.backup_addrs(id);
        pf_debug!(NS; "server {} backups: {:?}", id, backups);
        Self::write_ctrl(conn_write, &CtrlMsg::AssignBackups { backups }).await
    }

    /// Waits at the replica barrier while watching the link for an early
    /// leave or disconnect. Returns `Some(end)` if the link ended first.
    async fn wait_barrier(
        ctx: &NamingContext,
        id: ServerId,
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
        conn_write: &mut OwnedWriteHalf,
    ) -> Result<Option<LinkEnd>, NetFsError> {
        loop {
            tokio::select! {
                res = ctx.servers.wait_barrier() => {
                    res?;
                    return Ok(None);
                },

                msg = safe_tcp_read::<CtrlMsg, _>(read_buf, conn_read) => {
                    match msg {
                        Ok(CtrlMsg::Leave) => {
                            Self::write_ctrl(conn_write, &CtrlMsg::LeaveReply).await?;
                            return Ok(Some(LinkEnd::Graceful));
                        }
                        Ok(msg) => {
                            pf_warn!(NS; "ignoring msg from {} before barrier: {:?}", id, msg);
                        }
                        Err(_) => return Ok(Some(LinkEnd::Broken)),
                    }
                }
            }
        }
    }

    /// Serves the link after the barrier: forwards requests, matches replies
    /// to pending requests, and pushes backup assignments.
    async fn serve_link(
        ctx: &NamingContext,
        id: ServerId,
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
        conn_write: &mut OwnedWriteHalf,
        rx_link: &mut mpsc::UnboundedReceiver<LinkCmd>,
        pending: &mut HashMap<u64, oneshot::Sender<Response>>,
    ) -> LinkEnd {
        let mut next_seq: u64 = 0;
        loop {
            tokio::select! {
                // command from a request handler or another controller
                cmd = rx_link.recv() => {
                    let res = match cmd {
                        Some(LinkCmd::Forward { req, tx_resp }) => {
                            let seq = next_seq;
                            next_seq += 1;
                            pf_trace!(NS; "forward -> {} seq {} {:?}", id, seq, req);
                            pending.insert(seq, tx_resp);
                            Self::write_ctrl(conn_write, &CtrlMsg::Forward { seq, req }).await
                        }
                        Some(LinkCmd::PushBackups) => {
                            Self::send_backups(ctx, id, conn_write).await
                        }
                        None => return LinkEnd::Broken,
                    };
                    if let Err(e) = res {
                        pf_error!(NS; "error writing -> {}: {}", id, e);
                        return LinkEnd::Broken;
                    }
                },

                // message from the storage server
                msg = safe_tcp_read::<CtrlMsg, _>(read_buf, conn_read) => {
                    match msg {
                        Ok(CtrlMsg::Reply { seq, resp }) => {
                            match pending.remove(&seq) {
                                Some(tx_resp) => {
                                    if tx_resp.send(resp).is_err() {
                                        pf_debug!(NS; "requester of seq {} <- {} gone", seq, id);
                                    }
                                }
                                None => {
                                    pf_warn!(NS; "reply <- {} for unknown seq {}", id, seq);
                                }
                            }
                        }
                        Ok(CtrlMsg::Leave) => {
                            if let Err(e) = Self::write_ctrl(conn_write, &CtrlMsg::LeaveReply).await {
                                pf_warn!(NS; "error replying leave -> {}: {}", id, e);
                            }
                            return LinkEnd::Graceful;
                        }
                        Ok(msg) => {
                            pf_warn!(NS; "unexpected msg <- {}: {:?}", id, msg);
                        }
                        Err(e) => {
                            pf_warn!(NS; "link to server {} broke: {}", id, e);
                            return LinkEnd::Broken;
                        }
                    }
                }
            }
        }
    }

    /// Server controller thread function: one per storage server link.
    async fn server_controller_thread(
        ctx: Arc<NamingContext>,
        conn: TcpStream,
        addr: SocketAddr,
    ) {
        let (mut conn_read, mut conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let (tx_link, mut rx_link) = mpsc::unbounded_channel();

        let id = match Self::handshake(
            &ctx,
            addr,
            &mut read_buf,
            &mut conn_read,
            &mut conn_write,
            tx_link,
        )
        .await
        {
            Ok(id) => id,
            Err(e) => {
                pf_error!(NS; "registration from '{}' failed: {}", addr, e);
                return;
            }
        };
        pf_debug!(NS; "server_controller thread for {} '{}' spawned", id, addr);

        let mut pending = HashMap::new();
        let end = match Self::wait_barrier(
            &ctx,
            id,
            &mut read_buf,
            &mut conn_read,
            &mut conn_write,
        )
        .await
        {
            Ok(Some(end)) => end,
            Ok(None) => {
                // barrier passed: go live and distribute backup assignment
                ctx.servers.mark_active(id);
                match ctx.servers.assign_backup_servers(id) {
                    Ok(backups) => {
                        pf_info!(NS; "server {} active, backups {:?}", id, backups)
                    }
                    Err(e) => pf_error!(NS; "error assigning backups of {}: {}", id, e),
                }
                let short: Vec<ServerId> = ctx
                    .servers
                    .short_of_backups()
                    .into_iter()
                    .filter(|&server| server != id)
                    .collect();
                Self::reassign_backups_of(&ctx, &short);
                match Self::send_backups(&ctx, id, &mut conn_write).await {
                    Ok(()) => {
                        Self::serve_link(
                            &ctx,
                            id,
                            &mut read_buf,
                            &mut conn_read,
                            &mut conn_write,
                            &mut rx_link,
                            &mut pending,
                        )
                        .await
                    }
                    Err(_) => LinkEnd::Broken,
                }
            }
            Err(e) => {
                pf_error!(NS; "error waiting at barrier for {}: {}", id, e);
                LinkEnd::Broken
            }
        };

        // fail requests still waiting on this link
        for (_, tx_resp) in pending.drain() {
            let _ = tx_resp.send(Response::failure(
                ErrorCode::ServerUnavailable,
                format!("server {} disconnected", id),
            ));
        }

        match end {
            LinkEnd::Graceful => {
                let dropped = ctx.namespace.drop_owner(id);
                let backup_of = ctx
                    .servers
                    .remove(id)
                    .map(|handle| handle.backup_of)
                    .unwrap_or_default();
                pf_info!(NS; "server {} left, dropped {} paths", id, dropped);
                Self::reassign_backups_of(&ctx, &backup_of);
            }
            LinkEnd::Broken => {
                let backup_of = ctx
                    .servers
                    .get_by_id(id)
                    .map(|handle| handle.backup_of)
                    .unwrap_or_default();
                ctx.servers.set_inactive(id);
                ctx.namespace.invalidate_owner(id);
                pf_warn!(NS; "server {} marked inactive", id);
                Self::reassign_backups_of(&ctx, &backup_of);
            }
        }
        pf_debug!(NS; "server_controller thread for {} '{}' exitted", id, addr);
    }

    /// Picks new backups for servers that lost one to a departure or a
    /// broken link, and tells them about it.
    fn reassign_backups_of(ctx: &NamingContext, servers: &[ServerId]) {
        for &server in servers {
            if ctx.servers.assign_backup_servers(server).is_err() {
                continue;
            }
            if let Some(handle) = ctx.servers.get_by_id(server) {
                if let Err(e) = handle.push_backups() {
                    pf_warn!(NS; "error pushing backups -> {}: {}", server, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod reigner_tests {
    use super::*;

    #[test]
    fn origin_check() -> Result<(), NetFsError> {
        let peer: IpAddr = "10.1.2.3".parse()?;
        assert_eq!(ServerReigner::same_origin_ip("0.0.0.0", peer)?, peer);
        assert_eq!(ServerReigner::same_origin_ip("10.1.2.3", peer)?, peer);
        assert!(ServerReigner::same_origin_ip("10.1.2.4", peer).is_err());
        assert!(ServerReigner::same_origin_ip("not-an-ip", peer).is_err());
        Ok(())
    }
}

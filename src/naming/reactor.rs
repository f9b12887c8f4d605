//! Naming server's client-facing module: accepts client sessions and serves
//! their requests, one task per session.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::naming::handler::handle_request;
use crate::naming::{NamingContext, NS};
use crate::protocol::{ClientId, ClientMsg, NsReply};
use crate::utils::{
    safe_tcp_read, tcp_bind_with_retry, tcp_write_obj, NetFsError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// The client-facing reactor module.
pub(crate) struct ClientReactor {
    /// Address the client acceptor listens on.
    pub(crate) local_addr: SocketAddr,

    /// Join handle of the client acceptor thread.
    _client_acceptor_handle: JoinHandle<()>,
}

// ClientReactor public API implementation
impl ClientReactor {
    /// Creates the module and spawns the client acceptor thread.
    pub(crate) async fn new_and_setup(
        cli_addr: SocketAddr,
        ctx: Arc<NamingContext>,
    ) -> Result<Self, NetFsError> {
        let client_listener = tcp_bind_with_retry(cli_addr, 10).await?;
        let local_addr = client_listener.local_addr()?;
        let client_acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(ctx, client_listener));

        Ok(ClientReactor {
            local_addr,
            _client_acceptor_handle: client_acceptor_handle,
        })
    }
}

// ClientReactor client_acceptor thread implementation
impl ClientReactor {
    /// Registers a newly connected client and spawns its responder.
    async fn accept_new_client(
        ctx: &Arc<NamingContext>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), NetFsError> {
        let id = match ctx.clients.register(addr) {
            Ok(id) => id,
            Err(error_code) => {
                tcp_write_obj(&mut stream, &NsReply::Rejected { error_code })
                    .await?;
                return logged_err!(NS; "rejected client '{}': {}", addr, error_code);
            }
        };
        tcp_write_obj(&mut stream, &NsReply::Welcome { id }).await?;
        pf_debug!(NS; "accepted new client {} '{}'", id, addr);

        tokio::spawn(Self::client_responder_thread(
            ctx.clone(),
            id,
            addr,
            stream,
        ));
        Ok(())
    }

    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        ctx: Arc<NamingContext>,
        client_listener: TcpListener,
    ) {
        pf_debug!(NS; "client_acceptor thread spawned");

        loop {
            match client_listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) =
                        Self::accept_new_client(&ctx, stream, addr).await
                    {
                        pf_error!(NS; "error accepting new client: {}", e);
                    }
                }
                Err(e) => {
                    pf_warn!(NS; "error accepting client connection: {}", e);
                }
            }
        }
    }
}

// ClientReactor client_responder thread implementation
impl ClientReactor {
    /// Reads a client message from given read half.
    async fn read_msg(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<ClientMsg, NetFsError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a reply through given write half.
    async fn write_reply(
        conn_write: &mut OwnedWriteHalf,
        reply: &NsReply,
    ) -> Result<(), NetFsError> {
        tcp_write_obj(conn_write, reply).await
    }

    /// Client request listener and responder thread function. Requests of
    /// one session are served in order.
    async fn client_responder_thread(
        ctx: Arc<NamingContext>,
        id: ClientId,
        addr: SocketAddr,
        conn: TcpStream,
    ) {
        pf_debug!(NS; "client_responder thread for {} '{}' spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();

        loop {
            match Self::read_msg(&mut read_buf, &mut conn_read).await {
                Ok(ClientMsg::Req(req)) => {
                    pf_trace!(NS; "request <- {} {:?}", id, req);
                    let resp = handle_request(&ctx, req).await;
                    let reply = NsReply::Reply(resp);
                    if let Err(e) =
                        Self::write_reply(&mut conn_write, &reply).await
                    {
                        pf_error!(NS; "error replying -> {}: {}", id, e);
                        break;
                    }
                }

                Ok(ClientMsg::Leave) => {
                    // client leaving, send dummy reply and break
                    if let Err(e) =
                        Self::write_reply(&mut conn_write, &NsReply::LeaveReply)
                            .await
                    {
                        pf_error!(NS; "error replying leave -> {}: {}", id, e);
                    } else {
                        pf_debug!(NS; "client {} has left", id);
                    }
                    break;
                }

                Err(e) => {
                    pf_debug!(NS; "client {} session ended: {}", id, e);
                    break; // probably the client exitted ungracefully
                }
            }
        }

        ctx.clients.remove(id);
        pf_debug!(NS; "client_responder thread for {} '{}' exitted", id, addr);
    }
}

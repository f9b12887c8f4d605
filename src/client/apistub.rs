//! Connection stubs: a session with the naming server, and a data session
//! with a storage server.

use std::net::SocketAddr;

use crate::protocol::{
    recv_stream, send_stream, ClientId, ClientMsg, ErrorCode, NsReply, Request,
    Response, StreamEnd,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_read_frame, tcp_connect_with_retry, tcp_write_obj,
    NetFsError,
};

use bytes::BytesMut;

use tokio::io::{AsyncRead, AsyncWrite, Interest};
use tokio::net::TcpStream;
use tokio::time::{self, Duration};

/// Session with the naming server.
pub struct NamingStub {
    /// Client ID assigned to this session.
    id: ClientId,

    conn: TcpStream,
    read_buf: BytesMut,
}

impl NamingStub {
    /// Connects to the naming server at `addr` and waits for the session's
    /// welcome message.
    pub async fn connect(
        addr: SocketAddr,
        retries: u8,
    ) -> Result<Self, NetFsError> {
        let mut conn = tcp_connect_with_retry(None, addr, retries).await?;
        let mut read_buf = BytesMut::new();
        match safe_tcp_read(&mut read_buf, &mut conn).await? {
            NsReply::Welcome { id } => Ok(NamingStub { id, conn, read_buf }),
            NsReply::Rejected { error_code } => Err(NetFsError(format!(
                "naming server rejected session: {}",
                error_code
            ))),
            reply => Err(NetFsError(format!(
                "unexpected first reply {:?}",
                reply
            ))),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Sends one request and waits for its response.
    pub async fn call(&mut self, req: Request) -> Result<Response, NetFsError> {
        tcp_write_obj(&mut self.conn, &ClientMsg::Req(req)).await?;
        match safe_tcp_read(&mut self.read_buf, &mut self.conn).await? {
            NsReply::Reply(resp) => {
                resp.validate()?;
                Ok(resp)
            }
            reply => {
                Err(NetFsError(format!("unexpected reply {:?}", reply)))
            }
        }
    }

    /// Ends the session gracefully.
    pub async fn leave(mut self) -> Result<(), NetFsError> {
        tcp_write_obj(&mut self.conn, &ClientMsg::Leave).await?;
        loop {
            // skip replies to requests abandoned midway
            match safe_tcp_read(&mut self.read_buf, &mut self.conn).await? {
                NsReply::LeaveReply => return Ok(()),
                _ => continue,
            }
        }
    }

    /// Checks that the connection is still usable: it must become writable
    /// within `timeout` and must not have been closed by the peer.
    pub async fn is_alive(&self, timeout: Duration) -> bool {
        let interest = Interest::READABLE | Interest::WRITABLE;
        match time::timeout(timeout, self.conn.ready(interest)).await {
            Ok(Ok(ready)) => {
                !(ready.is_read_closed() || ready.is_write_closed())
                    && ready.is_writable()
            }
            _ => false,
        }
    }
}

/// Data session with a storage server.
pub struct DataStub {
    conn: TcpStream,
    read_buf: BytesMut,
    chunk_size: usize,
}

impl DataStub {
    /// Connects to the storage server at `addr`.
    pub async fn connect(
        addr: SocketAddr,
        chunk_size: usize,
    ) -> Result<Self, NetFsError> {
        let conn = tcp_connect_with_retry(None, addr, 0).await?;
        Ok(DataStub {
            conn,
            read_buf: BytesMut::new(),
            chunk_size,
        })
    }

    async fn read_resp(&mut self) -> Result<Response, NetFsError> {
        let resp: Response =
            safe_tcp_read(&mut self.read_buf, &mut self.conn).await?;
        resp.validate()?;
        Ok(resp)
    }

    /// Sends a READ request and streams the file's content into `sink`.
    pub async fn read<W>(
        &mut self,
        req: &Request,
        sink: &mut W,
    ) -> Result<Response, NetFsError>
    where
        W: AsyncWrite + Unpin,
    {
        tcp_write_obj(&mut self.conn, req).await?;
        let stop = safe_tcp_read_frame(&mut self.read_buf, &mut self.conn)
            .await?;
        let end =
            recv_stream(&mut self.read_buf, &mut self.conn, &stop, sink).await?;
        let resp = self.read_resp().await?;
        match end {
            StreamEnd::Failed(e) if resp.is_success() => Ok(Response::failure(
                ErrorCode::IoFailure,
                format!("local sink failed: {}", e),
            )),
            _ => Ok(resp),
        }
    }

    /// Sends a WRITE request and streams all of `src` as the new content.
    pub async fn write<R>(
        &mut self,
        req: &Request,
        src: &mut R,
    ) -> Result<Response, NetFsError>
    where
        R: AsyncRead + Unpin,
    {
        tcp_write_obj(&mut self.conn, req).await?;
        let stop = safe_tcp_read_frame(&mut self.read_buf, &mut self.conn)
            .await?;
        let end =
            send_stream(&mut self.conn, src, &stop, self.chunk_size).await?;
        let resp = self.read_resp().await?;
        match end {
            StreamEnd::Failed(e) if resp.is_success() => Ok(Response::failure(
                ErrorCode::IoFailure,
                format!("local source failed midway: {}", e),
            )),
            _ => Ok(resp),
        }
    }

    /// Sends a request that carries no data stream and waits for its
    /// response.
    pub async fn call(&mut self, req: &Request) -> Result<Response, NetFsError> {
        tcp_write_obj(&mut self.conn, req).await?;
        self.read_resp().await
    }
}

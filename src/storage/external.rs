//! Storage server's client-facing API: serves READ, WRITE and INFO from
//! clients directly, and replica pushes from primaries this server backs up.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::protocol::{
    new_stop_sequence, recv_stream, send_stream, ErrorCode, OpCode, Request,
    Response, StreamEnd, FLAG_APPEND, FLAG_DIRECTORY, FLAG_REPLICA,
};
use crate::storage::filestore::{
    is_replica_path, normalize, OpError, OpResult,
};
use crate::storage::{FairRwLock, StorageContext};
use crate::utils::{
    safe_tcp_read, tcp_write_frame, tcp_write_obj, NetFsError,
};

use bytes::BytesMut;

use tokio::io;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// The external client-facing API module.
pub(crate) struct ExternalApi {
    /// Address the client acceptor listens on.
    pub(crate) local_addr: SocketAddr,

    /// Join handle of the client acceptor thread.
    client_acceptor_handle: JoinHandle<()>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Spawns the client acceptor thread on an already bound listener.
    pub(crate) fn new_and_setup(
        client_listener: TcpListener,
        ctx: Arc<StorageContext>,
    ) -> Result<Self, NetFsError> {
        let local_addr = client_listener.local_addr()?;
        let client_acceptor_handle =
            tokio::spawn(Self::client_acceptor_thread(ctx, client_listener));

        Ok(ExternalApi {
            local_addr,
            client_acceptor_handle,
        })
    }
}

impl Drop for ExternalApi {
    fn drop(&mut self) {
        self.client_acceptor_handle.abort();
    }
}

// ExternalApi client_acceptor thread implementation
impl ExternalApi {
    /// Client acceptor thread function.
    async fn client_acceptor_thread(
        ctx: Arc<StorageContext>,
        client_listener: TcpListener,
    ) {
        pf_debug!(ctx.me; "client_acceptor thread spawned");

        loop {
            match client_listener.accept().await {
                Ok((stream, addr)) => {
                    pf_debug!(ctx.me; "accepted data session from '{}'", addr);
                    tokio::spawn(Self::client_servant_thread(
                        ctx.clone(),
                        addr,
                        stream,
                    ));
                }
                Err(e) => {
                    pf_warn!(ctx.me; "error accepting client connection: {}", e);
                }
            }
        }
    }
}

// ExternalApi client_servant thread implementation
impl ExternalApi {
    /// Resolves the target of a data request to its normalized path and
    /// lock. Replica pushes may only touch the replica area; clients reach
    /// it only after a backup redirect.
    async fn target(
        ctx: &StorageContext,
        req: &Request,
    ) -> OpResult<(String, Arc<FairRwLock>)> {
        req.validate()
            .map_err(|e| OpError::new(ErrorCode::ProtocolError, e))?;
        let path = normalize(&req.path)?;
        let replica = req.has_flag(FLAG_REPLICA);
        if replica && !is_replica_path(&path) {
            return Err(OpError::new(
                ErrorCode::InvalidOperation,
                format!("'{}' not accessible this way", path),
            ));
        }
        if replica && req.op == OpCode::Write {
            ctx.store.ensure_replica(&path, false).await?;
        }
        let lock = ctx.store.lock_of(&path)?;
        Ok((path, lock))
    }

    /// Serves a READ: stop sequence, file content, stop sequence, response.
    async fn serve_read(
        ctx: &StorageContext,
        req: &Request,
        conn: &mut TcpStream,
    ) -> Result<Response, NetFsError> {
        let stop = new_stop_sequence();
        tcp_write_frame(conn, &stop).await?;

        let (path, lock) = match Self::target(ctx, req).await {
            Ok(target) => target,
            Err(e) => {
                tcp_write_frame(conn, &stop).await?;
                return Ok(e.into());
            }
        };
        let _guard = lock.acquire_read().await?;
        let mut file = match ctx.store.open_read(&path).await {
            Ok(file) => file,
            Err(e) => {
                tcp_write_frame(conn, &stop).await?;
                return Ok(e.into());
            }
        };

        match send_stream(conn, &mut file, &stop, ctx.chunk_size).await? {
            StreamEnd::Complete(n) => {
                pf_trace!(ctx.me; "read '{}' {} bytes", path, n);
                Ok(Response::success(format!("{} bytes", n)))
            }
            StreamEnd::Failed(e) => {
                Ok(Response::failure(ErrorCode::IoFailure, e))
            }
        }
    }

    /// Serves a WRITE: stop sequence, then the client's content terminated
    /// by the stop sequence, then the response. Content sent for a target
    /// that cannot be written is drained and discarded.
    async fn serve_write(
        ctx: &StorageContext,
        req: &Request,
        read_buf: &mut BytesMut,
        conn: &mut TcpStream,
    ) -> Result<Response, NetFsError> {
        let stop = new_stop_sequence();
        tcp_write_frame(conn, &stop).await?;

        let (path, lock) = match Self::target(ctx, req).await {
            Ok(target) => target,
            Err(e) => {
                recv_stream(read_buf, conn, &stop, &mut io::sink()).await?;
                return Ok(e.into());
            }
        };
        let _guard = lock.acquire_write().await?;
        let append = req.has_flag(FLAG_APPEND);
        let mut file = match ctx.store.open_write(&path, append).await {
            Ok(file) => file,
            Err(e) => {
                recv_stream(read_buf, conn, &stop, &mut io::sink()).await?;
                return Ok(e.into());
            }
        };

        match recv_stream(read_buf, conn, &stop, &mut file).await? {
            StreamEnd::Complete(n) => {
                drop(file);
                pf_trace!(ctx.me; "wrote '{}' {} bytes", path, n);
                if !is_replica_path(&path) {
                    // still under the write lock
                    ctx.replicator.push_file(&ctx.store, &path).await;
                }
                Ok(Response::success(format!("{} bytes", n)))
            }
            StreamEnd::Failed(e) => {
                Ok(Response::failure(ErrorCode::IoFailure, e))
            }
        }
    }

    async fn serve_info(
        ctx: &StorageContext,
        req: &Request,
    ) -> OpResult<Response> {
        let (path, lock) = Self::target(ctx, req).await?;
        let _guard = lock.acquire_read().await?;
        Ok(Response::success(ctx.store.info(&path).await?))
    }

    /// Applies a replica CREATE or DELETE pushed by a primary.
    async fn serve_replica_ctrl(
        ctx: &StorageContext,
        req: &Request,
    ) -> OpResult<Response> {
        req.validate()
            .map_err(|e| OpError::new(ErrorCode::ProtocolError, e))?;
        let path = normalize(&req.path)?;
        match req.op {
            OpCode::Create => {
                let dir = req.has_flag(FLAG_DIRECTORY);
                ctx.store.ensure_replica(&path, dir).await?;
            }
            _ => {
                let locks = ctx.store.locks_under(&path);
                let mut guards = Vec::with_capacity(locks.len());
                for (_, lock) in &locks {
                    guards.push(lock.acquire_write().await?);
                }
                ctx.store.remove_replica(&path).await?;
                drop(guards);
            }
        }
        Ok(Response::success(""))
    }

    /// Serves one request of a data session.
    async fn serve_request(
        ctx: &StorageContext,
        req: Request,
        read_buf: &mut BytesMut,
        conn: &mut TcpStream,
    ) -> Result<Response, NetFsError> {
        let replica = req.has_flag(FLAG_REPLICA);
        Ok(match req.op {
            OpCode::Read => Self::serve_read(ctx, &req, conn).await?,
            OpCode::Write => {
                Self::serve_write(ctx, &req, read_buf, conn).await?
            }
            OpCode::Info => Self::serve_info(ctx, &req)
                .await
                .unwrap_or_else(Response::from),
            OpCode::Create | OpCode::Delete if replica => {
                Self::serve_replica_ctrl(ctx, &req)
                    .await
                    .unwrap_or_else(Response::from)
            }
            op => Response::failure(
                ErrorCode::InvalidOperation,
                format!("{:?} must go through the naming server", op),
            ),
        })
    }

    /// Client data session thread function.
    async fn client_servant_thread(
        ctx: Arc<StorageContext>,
        addr: SocketAddr,
        mut conn: TcpStream,
    ) {
        let mut read_buf = BytesMut::new();

        loop {
            let req: Request = match safe_tcp_read(&mut read_buf, &mut conn)
                .await
            {
                Ok(req) => req,
                Err(_) => break, // session closed
            };
            pf_trace!(ctx.me; "request <- '{}' {:?}", addr, req);

            let resp = match Self::serve_request(
                &ctx,
                req,
                &mut read_buf,
                &mut conn,
            )
            .await
            {
                Ok(resp) => resp.truncated(),
                Err(e) => {
                    pf_error!(ctx.me; "error serving '{}': {}", addr, e);
                    break;
                }
            };
            if let Err(e) = tcp_write_obj(&mut conn, &resp).await {
                pf_error!(ctx.me; "error replying -> '{}': {}", addr, e);
                break;
            }
        }

        pf_debug!(ctx.me; "data session with '{}' ended", addr);
    }
}

#[cfg(test)]
mod external_tests {
    use super::*;
    use crate::storage::{FileStore, Replicator};
    use crate::utils::{safe_tcp_read_frame, tcp_bind_with_retry};
    use tokio::fs;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_session_hello_world() -> Result<(), NetFsError> {
        let root = std::env::temp_dir().join("netfs-external-write");
        if fs::metadata(&root).await.is_ok() {
            fs::remove_dir_all(&root).await?;
        }
        fs::create_dir_all(root.join("docs")).await?;
        fs::write(root.join("docs/hello.txt"), b"stale content").await?;
        let (store, _) =
            FileStore::new_and_populate(&root, &["docs".into()]).await?;
        let ctx = Arc::new(StorageContext {
            me: "ss0".into(),
            store,
            replicator: Replicator::new("ss0".into(), 1024),
            chunk_size: 1024,
        });
        let listener =
            tcp_bind_with_retry("127.0.0.1:46500".parse()?, 10).await?;
        let api = ExternalApi::new_and_setup(listener, ctx)?;

        let mut conn = TcpStream::connect(api.local_addr).await?;
        let mut read_buf = BytesMut::new();
        let req = Request::new(OpCode::Write, 1, "/docs/hello.txt");
        tcp_write_obj(&mut conn, &req).await?;
        let stop = safe_tcp_read_frame(&mut read_buf, &mut conn).await?;
        tcp_write_frame(&mut conn, b"hello").await?;
        tcp_write_frame(&mut conn, b"world").await?;
        tcp_write_frame(&mut conn, &stop).await?;
        let resp: Response = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert!(resp.is_success());
        assert_eq!(resp.error_code, ErrorCode::Success);
        assert_eq!(fs::read(root.join("docs/hello.txt")).await?, b"helloworld");

        // same session, unexposed target: content drained, then a failure
        let req = Request::new(OpCode::Write, 1, "/docs/missing.txt");
        tcp_write_obj(&mut conn, &req).await?;
        let stop = safe_tcp_read_frame(&mut read_buf, &mut conn).await?;
        tcp_write_frame(&mut conn, b"lost").await?;
        tcp_write_frame(&mut conn, &stop).await?;
        let resp: Response = safe_tcp_read(&mut read_buf, &mut conn).await?;
        assert_eq!(resp.error_code, ErrorCode::PathNotFound);
        assert!(fs::metadata(root.join("docs/missing.txt")).await.is_err());
        Ok(())
    }
}

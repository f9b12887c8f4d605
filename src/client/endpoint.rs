//! Client endpoint: resolves paths through the naming server, then talks to
//! the storage server holding them, following backup redirects.

use std::net::SocketAddr;

use crate::client::{DataStub, NamingStub};
use crate::protocol::{
    backup_path, parse_addr, ClientId, OpCode, ReplyFlag, Request, Response,
    DEFAULT_CHUNK_SIZE, FLAG_APPEND, FLAG_DIRECTORY,
};
use crate::utils::NetFsError;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on how long a liveness probe waits for the naming server
    /// connection to become writable.
    pub probe_interval_ms: u64,

    /// Connection retries towards the naming server.
    pub connect_retries: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            probe_interval_ms: 1000,
            connect_retries: 3,
        }
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProbeStatus {
    /// Session was healthy; carries the unchanged client ID.
    Alive(ClientId),

    /// Session had to be re-established; carries the new client ID.
    Reconnected(ClientId),
}

/// Where a direct operation has to go.
enum Route {
    /// Storage server to send the (possibly rewritten) request to.
    Direct(SocketAddr, Request),

    /// Final answer from the naming server.
    Done(Response),
}

/// Client endpoint of the file system.
pub struct ClientEndpoint {
    /// Log prefix.
    me: String,

    ns_addr: SocketAddr,
    config: ClientConfig,

    /// Session with the naming server; `None` after it broke.
    stub: Option<NamingStub>,
}

impl ClientEndpoint {
    /// Creates a new client endpoint connected to the naming server at
    /// `ns_addr`.
    pub async fn new_and_setup(
        ns_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, NetFsError> {
        let config = parsed_config!(config_str => ClientConfig;
                                    probe_interval_ms, connect_retries)?;
        if config.probe_interval_ms == 0 {
            return logged_err!(
                "c";
                "invalid config.probe_interval_ms '{}'",
                config.probe_interval_ms
            );
        }

        let stub = NamingStub::connect(ns_addr, config.connect_retries).await?;
        let me = format!("c{}", stub.id());
        pf_debug!(me; "session established with '{}'", ns_addr);

        Ok(ClientEndpoint {
            me,
            ns_addr,
            config,
            stub: Some(stub),
        })
    }

    /// Current client ID, if the session is up.
    pub fn id(&self) -> Option<ClientId> {
        self.stub.as_ref().map(|stub| stub.id())
    }

    async fn reconnect(&mut self) -> Result<ClientId, NetFsError> {
        self.stub = None;
        let stub =
            NamingStub::connect(self.ns_addr, self.config.connect_retries)
                .await?;
        let id = stub.id();
        self.me = format!("c{}", id);
        self.stub = Some(stub);
        pf_info!(self.me; "session re-established with '{}'", self.ns_addr);
        Ok(id)
    }

    /// Checks the naming server session, re-establishing it if it errored,
    /// closed, or did not become writable in time.
    pub async fn probe(&mut self) -> Result<ProbeStatus, NetFsError> {
        let timeout = Duration::from_millis(self.config.probe_interval_ms);
        if let Some(stub) = &self.stub {
            if stub.is_alive(timeout).await {
                return Ok(ProbeStatus::Alive(stub.id()));
            }
            pf_warn!(self.me; "naming server session lost");
        }
        Ok(ProbeStatus::Reconnected(self.reconnect().await?))
    }

    /// Sends a request built from `op` and `path` to the naming server.
    async fn call_ns(
        &mut self,
        op: OpCode,
        path: &str,
        dest: Option<&str>,
        flags: i32,
    ) -> Result<(Request, Response), NetFsError> {
        if self.stub.is_none() {
            self.reconnect().await?;
        }
        let stub = match self.stub.as_mut() {
            Some(stub) => stub,
            None => return logged_err!(self.me; "no naming server session"),
        };

        let mut req = Request::new(op, stub.id(), path).with_flags(flags);
        if let Some(dest) = dest {
            req = req.with_dest(dest);
        }
        match stub.call(req.clone()).await {
            Ok(resp) => Ok((req, resp)),
            Err(e) => {
                // the session is unusable after a broken exchange
                self.stub = None;
                Err(e)
            }
        }
    }

    /// Resolves where a direct operation on `path` has to go.
    async fn locate(
        &mut self,
        op: OpCode,
        path: &str,
        flags: i32,
    ) -> Result<Route, NetFsError> {
        let (mut req, resp) = self.call_ns(op, path, None, flags).await?;
        match resp.flags {
            ReplyFlag::Success => {
                Ok(Route::Direct(parse_addr(&resp.data)?, req))
            }
            ReplyFlag::BackupRedirect => {
                let addr = parse_addr(&resp.data)?;
                req.path = backup_path(path)?;
                pf_info!(self.me; "'{}' redirected to backup '{}'", path, addr);
                Ok(Route::Direct(addr, req))
            }
            ReplyFlag::Failure => Ok(Route::Done(resp)),
        }
    }

    /// Reads the file at `path` into `sink`.
    pub async fn read<W>(
        &mut self,
        path: &str,
        sink: &mut W,
    ) -> Result<Response, NetFsError>
    where
        W: AsyncWrite + Unpin,
    {
        match self.locate(OpCode::Read, path, 0).await? {
            Route::Direct(addr, req) => {
                let mut data =
                    DataStub::connect(addr, DEFAULT_CHUNK_SIZE).await?;
                data.read(&req, sink).await
            }
            Route::Done(resp) => Ok(resp),
        }
    }

    /// Writes all of `src` to the file at `path`, appending if `append` is
    /// set and overwriting otherwise.
    pub async fn write<R>(
        &mut self,
        path: &str,
        src: &mut R,
        append: bool,
    ) -> Result<Response, NetFsError>
    where
        R: AsyncRead + Unpin,
    {
        let flags = if append { FLAG_APPEND } else { 0 };
        match self.locate(OpCode::Write, path, flags).await? {
            Route::Direct(addr, req) => {
                let mut data =
                    DataStub::connect(addr, DEFAULT_CHUNK_SIZE).await?;
                data.write(&req, src).await
            }
            Route::Done(resp) => Ok(resp),
        }
    }

    /// Gets size, permissions and modification time of `path`.
    pub async fn info(&mut self, path: &str) -> Result<Response, NetFsError> {
        match self.locate(OpCode::Info, path, 0).await? {
            Route::Direct(addr, req) => {
                let mut data =
                    DataStub::connect(addr, DEFAULT_CHUNK_SIZE).await?;
                data.call(&req).await
            }
            Route::Done(resp) => Ok(resp),
        }
    }

    /// Creates an empty file, or a directory if `dir` is set.
    pub async fn create(
        &mut self,
        path: &str,
        dir: bool,
    ) -> Result<Response, NetFsError> {
        let flags = if dir { FLAG_DIRECTORY } else { 0 };
        Ok(self.call_ns(OpCode::Create, path, None, flags).await?.1)
    }

    pub async fn delete(&mut self, path: &str) -> Result<Response, NetFsError> {
        Ok(self.call_ns(OpCode::Delete, path, None, 0).await?.1)
    }

    /// Renders the namespace subtree at `path`.
    pub async fn list(&mut self, path: &str) -> Result<Response, NetFsError> {
        Ok(self.call_ns(OpCode::List, path, None, 0).await?.1)
    }

    pub async fn copy(
        &mut self,
        from: &str,
        to: &str,
    ) -> Result<Response, NetFsError> {
        Ok(self.call_ns(OpCode::Copy, from, Some(to), 0).await?.1)
    }

    pub async fn move_to(
        &mut self,
        from: &str,
        to: &str,
    ) -> Result<Response, NetFsError> {
        Ok(self.call_ns(OpCode::Move, from, Some(to), 0).await?.1)
    }

    /// Renames the last segment of `path` to `new_name`.
    pub async fn rename(
        &mut self,
        path: &str,
        new_name: &str,
    ) -> Result<Response, NetFsError> {
        Ok(self
            .call_ns(OpCode::Rename, path, Some(new_name), 0)
            .await?
            .1)
    }

    /// Ends the naming server session gracefully.
    pub async fn leave(mut self) -> Result<(), NetFsError> {
        if let Some(stub) = self.stub.take() {
            stub.leave().await?;
            pf_debug!(self.me; "left naming server '{}'", self.ns_addr);
        }
        Ok(())
    }
}

//! Storage server's link to the naming server.

use std::net::SocketAddr;

use crate::protocol::{CtrlMsg, ServerId, StorageServerInit};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_obj, NetFsError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The naming server link handler module.
pub(crate) struct ControlHub {
    /// My server ID assigned at registration.
    pub(crate) id: ServerId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<CtrlMsg>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<CtrlMsg>,

    /// Control messenger thread join handle.
    control_messenger_handle: JoinHandle<()>,
}

// ControlHub public API implementation
impl ControlHub {
    /// Connects to the naming server and registers, getting assigned my
    /// server ID. Spawns the control messenger thread, which forwards
    /// incoming link messages to the recv channel and writes out whatever
    /// arrives on the send channel.
    pub(crate) async fn new_and_setup(
        bind_addr: Option<SocketAddr>,
        naming: SocketAddr,
        ip: String,
        client_port: u16,
        mount_paths: Vec<String>,
    ) -> Result<Self, NetFsError> {
        pf_debug!("ss"; "connecting to naming server '{}'...", naming);
        let mut stream =
            tcp_connect_with_retry(bind_addr, naming, 10).await?;
        let init = StorageServerInit {
            ip,
            client_port,
            ns_port: stream.local_addr()?.port(),
            mount_paths,
        };
        tcp_write_obj(&mut stream, &CtrlMsg::Register(init)).await?;

        let mut read_buf = BytesMut::new();
        let id = match safe_tcp_read(&mut read_buf, &mut stream).await? {
            CtrlMsg::Registered { id } => id,
            CtrlMsg::Rejected { error_code, reason } => {
                return logged_err!("ss"; "registration rejected: {} {}",
                                         error_code, reason);
            }
            msg => {
                return logged_err!("ss"; "unexpected registration reply {:?}",
                                         msg);
            }
        };
        pf_debug!("ss"; "assigned server ID: {}", id);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();

        let control_messenger_handle =
            tokio::spawn(Self::control_messenger_thread(
                format!("ss{}", id),
                stream,
                read_buf,
                tx_recv,
                rx_send,
            ));

        Ok(ControlHub {
            id,
            rx_recv,
            tx_send,
            control_messenger_handle,
        })
    }

    /// Waits for the next message from the naming server.
    pub(crate) async fn recv_ctrl(&mut self) -> Result<CtrlMsg, NetFsError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!(self.id; "recv channel has been closed"),
        }
    }

    /// Sends a message to the naming server.
    pub(crate) fn send_ctrl(&self, msg: CtrlMsg) -> Result<(), NetFsError> {
        self.tx_send.send(msg)?;
        Ok(())
    }

    /// Clone of the send channel, for tasks replying to forwarded requests.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<CtrlMsg> {
        self.tx_send.clone()
    }

    /// Deregisters gracefully, discarding whatever else arrives until the
    /// naming server acknowledges.
    pub(crate) async fn leave(&mut self) -> Result<(), NetFsError> {
        self.send_ctrl(CtrlMsg::Leave)?;
        loop {
            if let CtrlMsg::LeaveReply = self.recv_ctrl().await? {
                return Ok(());
            }
        }
    }
}

impl Drop for ControlHub {
    fn drop(&mut self) {
        self.control_messenger_handle.abort();
    }
}

// ControlHub control_messenger thread implementation
impl ControlHub {
    async fn read_ctrl(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<CtrlMsg, NetFsError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    async fn write_ctrl(
        conn_write: &mut OwnedWriteHalf,
        msg: &CtrlMsg,
    ) -> Result<(), NetFsError> {
        tcp_write_obj(conn_write, msg).await
    }

    /// Naming server link listener and sender thread function.
    async fn control_messenger_thread(
        me: String,
        conn: TcpStream,
        mut read_buf: BytesMut,
        tx_recv: mpsc::UnboundedSender<CtrlMsg>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
    ) {
        pf_debug!(me; "control_messenger thread spawned");

        let (mut conn_read, mut conn_write) = conn.into_split();

        loop {
            tokio::select! {
                // gets a message to send to the naming server
                msg = rx_send.recv() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = Self::write_ctrl(&mut conn_write, &msg).await {
                                pf_error!(me; "error sending ctrl: {}", e);
                                break;
                            }
                        },
                        None => break, // channel closed and no messages remain
                    }
                },

                // receives a message from the naming server
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            pf_trace!(me; "recv ctrl {:?}", msg);
                            if let Err(e) = tx_recv.send(msg) {
                                pf_error!(me; "error sending to tx_recv: {}", e);
                            }
                        },
                        Err(e) => {
                            pf_error!(me; "error reading ctrl: {}", e);
                            break; // probably the naming server went away
                        }
                    }
                }
            }
        }

        pf_debug!(me; "control_messenger thread exited");
    }
}

//! Safe TCP bind/connect/read/write helper functions.
//!
//! Every message on a netfs connection is a frame: an 8-byte big-endian
//! length followed by that many bytes of payload. Structured messages are
//! MessagePack-encoded payloads; data chunks are raw payloads.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::NetFsError;

use bytes::{Bytes, BytesMut};

use serde::Serialize;
use serde::de::DeserializeOwned;

use rmp_serde::encode::to_vec as encode_to_vec;
use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

/// Hard upper bound on the payload length of a single frame. Anything longer
/// is treated as a framing error.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Receives one frame from TCP readable connection `conn_read`, using
/// `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(bytes)` if successful; upon returning, bytes of this frame are
///     removed from the read buffer (bytes of later frames are kept)
///   - `Err(err)` if the peer closed, the frame is oversized, or any other
///     unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function is intended to be used as a `tokio::select!` branch
/// and that those two methods are not cancellation-safe. Instead, in the case
/// of being cancelled midway before receiving the entire frame, bytes already
/// read are stored in the read buffer and will continue to be appended by
/// future invocations until successful returning.
pub async fn safe_tcp_read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<Bytes, NetFsError>
where
    Conn: AsyncReadExt + Unpin,
{
    // read length of frame first
    if read_buf.capacity() < 8 {
        read_buf.reserve(8 - read_buf.capacity());
    }
    while read_buf.len() < 8 {
        // frame_len not wholesomely read from socket before last cancellation
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(NetFsError::msg("connection closed by peer"));
        }
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&read_buf[..8]);
    let frame_len = u64::from_be_bytes(len_bytes);
    if frame_len > MAX_FRAME_LEN as u64 {
        return Err(NetFsError(format!(
            "frame length {} exceeds limit {}",
            frame_len, MAX_FRAME_LEN
        )));
    }

    // then read the frame itself
    let frame_end = 8 + frame_len as usize;
    if read_buf.capacity() < frame_end {
        // capacity not big enough, reserve more space
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(NetFsError(format!(
                "short read: got {} of {} frame bytes",
                read_buf.len() - 8,
                frame_len
            )));
        }
    }

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); split off the bytes
    // used in this call, keeping whatever follows
    let mut frame = read_buf.split_to(frame_end);
    Ok(frame.split_off(8).freeze())
}

/// Receives an object of type `T` from TCP readable connection `conn_read`.
/// Cancellation safe in the same way as `safe_tcp_read_frame()`.
pub async fn safe_tcp_read<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, NetFsError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let frame = safe_tcp_read_frame(read_buf, conn_read).await?;
    let obj = decode_from_slice(&frame)?;
    Ok(obj)
}

/// Sends raw bytes as one frame to TCP writable connection `conn_write`.
/// Not cancellation safe; must not be used as a `tokio::select!` branch.
pub async fn tcp_write_frame<Conn>(
    conn_write: &mut Conn,
    bytes: &[u8],
) -> Result<(), NetFsError>
where
    Conn: AsyncWriteExt + Unpin,
{
    if bytes.len() > MAX_FRAME_LEN {
        return Err(NetFsError(format!(
            "frame length {} exceeds limit {}",
            bytes.len(),
            MAX_FRAME_LEN
        )));
    }
    conn_write.write_u64(bytes.len() as u64).await?; // send length first
    conn_write.write_all(bytes).await?;
    Ok(())
}

/// Sends an object of type `T` as one frame to TCP writable connection
/// `conn_write`. Not cancellation safe.
pub async fn tcp_write_obj<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), NetFsError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    tcp_write_frame(conn_write, &obj_bytes).await
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, NetFsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
/// If `bind_addr` is given, the local end of the connection is bound to it.
pub async fn tcp_connect_with_retry(
    bind_addr: Option<SocketAddr>,
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, NetFsError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        if let Some(bind_addr) = bind_addr {
            socket.bind(bind_addr)?;
        }

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

//! Chunked data transfer delimited by a per-session stop sequence.
//!
//! The storage server opens every READ/WRITE exchange by sending a freshly
//! generated stop sequence. Data then flows as raw frames of at most
//! `chunk_size` bytes, and a frame equal to the stop sequence marks the end
//! of the stream.

use std::io;
use std::marker::Unpin;

use crate::utils::{safe_tcp_read_frame, tcp_write_frame, NetFsError};

use bytes::BytesMut;

use rand::distributions::Alphanumeric;
use rand::Rng;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Byte length of a generated stop sequence.
pub const STOP_SEQUENCE_LEN: usize = 32;

/// Default data chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How a data stream ended when the transport itself stayed healthy.
#[derive(Debug)]
pub enum StreamEnd {
    /// All data moved; carries the number of bytes transferred.
    Complete(u64),

    /// The local source (when sending) or sink (when receiving) failed. The
    /// stream was still terminated properly with the stop sequence.
    Failed(io::Error),
}

/// Generates a random alphanumeric stop sequence.
pub fn new_stop_sequence() -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STOP_SEQUENCE_LEN)
        .collect()
}

/// Reads from `src` until `buf` is full or `src` is exhausted.
async fn fill_chunk<R>(src: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Streams all of `src` to `conn_write` in frames of `chunk_size` bytes,
/// followed by the stop sequence `stop`. A failing source ends the stream
/// early (still terminated by `stop`) and is reported as
/// `StreamEnd::Failed`; transport errors are returned as `Err`.
pub async fn send_stream<R, W>(
    conn_write: &mut W,
    src: &mut R,
    stop: &[u8],
    chunk_size: usize,
) -> Result<StreamEnd, NetFsError>
where
    R: AsyncRead + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0;
    let end = loop {
        match fill_chunk(src, &mut buf).await {
            Ok(0) => break StreamEnd::Complete(sent),
            Ok(n) => {
                tcp_write_frame(conn_write, &buf[..n]).await?;
                sent += n as u64;
            }
            Err(e) => break StreamEnd::Failed(e),
        }
    };
    tcp_write_frame(conn_write, stop).await?;
    Ok(end)
}

/// Receives frames from `conn_read` into `sink` until a frame equal to the
/// stop sequence `stop` arrives. A failing sink stops being written to but
/// the stream is still drained to its end and reported as
/// `StreamEnd::Failed`; transport errors are returned as `Err`.
pub async fn recv_stream<R, W>(
    read_buf: &mut BytesMut,
    conn_read: &mut R,
    stop: &[u8],
    sink: &mut W,
) -> Result<StreamEnd, NetFsError>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut received = 0;
    let mut sink_err = None;
    loop {
        let frame = safe_tcp_read_frame(read_buf, conn_read).await?;
        if &frame[..] == stop {
            break;
        }
        if sink_err.is_none() {
            match sink.write_all(&frame).await {
                Ok(()) => received += frame.len() as u64,
                Err(e) => sink_err = Some(e),
            }
        }
    }

    if let Some(e) = sink_err {
        return Ok(StreamEnd::Failed(e));
    }
    if let Err(e) = sink.flush().await {
        return Ok(StreamEnd::Failed(e));
    }
    Ok(StreamEnd::Complete(received))
}

#[cfg(test)]
mod stream_tests {
    use super::*;
    use crate::utils::{tcp_bind_with_retry, tcp_connect_with_retry};

    #[test]
    fn stop_sequences_differ() {
        let a = new_stop_sequence();
        let b = new_stop_sequence();
        assert_eq!(a.len(), STOP_SEQUENCE_LEN);
        assert!(a.iter().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn chunks_then_stop() -> Result<(), NetFsError> {
        let listener = tcp_bind_with_retry("127.0.0.1:46110".parse()?, 3).await?;
        let stop = new_stop_sequence();
        let stop2 = stop.clone();
        let sender = tokio::spawn(async move {
            let mut stream =
                tcp_connect_with_retry(None, "127.0.0.1:46110".parse()?, 3)
                    .await?;
            let mut src: &[u8] = b"hello world, chunked";
            let end = send_stream(&mut stream, &mut src, &stop2, 6).await?;
            Ok::<StreamEnd, NetFsError>(end)
        });

        let (mut conn, _) = listener.accept().await?;
        let mut read_buf = BytesMut::new();
        let mut sink = Vec::new();
        let end = recv_stream(&mut read_buf, &mut conn, &stop, &mut sink).await?;
        assert!(matches!(end, StreamEnd::Complete(20)));
        assert_eq!(sink, b"hello world, chunked");
        assert!(matches!(sender.await??, StreamEnd::Complete(20)));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_stream() -> Result<(), NetFsError> {
        let listener = tcp_bind_with_retry("127.0.0.1:46111".parse()?, 3).await?;
        let stop = new_stop_sequence();
        let stop2 = stop.clone();
        tokio::spawn(async move {
            let mut stream =
                tcp_connect_with_retry(None, "127.0.0.1:46111".parse()?, 3)
                    .await?;
            let mut src: &[u8] = b"";
            send_stream(&mut stream, &mut src, &stop2, 8).await?;
            Ok::<(), NetFsError>(())
        });

        let (mut conn, _) = listener.accept().await?;
        let mut read_buf = BytesMut::new();
        let mut sink = Vec::new();
        let end = recv_stream(&mut read_buf, &mut conn, &stop, &mut sink).await?;
        assert!(matches!(end, StreamEnd::Complete(0)));
        assert!(sink.is_empty());
        Ok(())
    }
}

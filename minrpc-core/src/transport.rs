//! Byte-channel transport abstraction.
//!
//! The wire protocol is carried over whatever channel the embedder hands the
//! endpoint — a socket, a pipe to a subprocess, a hardware UART. This module
//! defines the minimal contract the rest of the crate needs from that
//! channel, plus an in-process duplex pipe used by tests (and by the
//! multi-hop scenarios where one endpoint's remote session is itself
//! another endpoint, all in the same process).
//!
//! `compio`'s own [`compio::io::AsyncRead`]/[`AsyncWrite`] traits are
//! completion-based: a call takes ownership of a buffer and hands it back.
//! That's the right shape for driving a real fd under io_uring, but it is
//! awkward for a protocol layer that just wants to fill a `&mut [u8]` a
//! caller already owns. [`Transport`] is the simpler borrow-based contract
//! the rest of the crate is written against; [`compio_bridge`] below adapts
//! any real compio stream onto it.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flume::{Receiver, Sender};

/// A duplex byte channel.
///
/// Implementations are not required to preserve message boundaries — the
/// wire protocol is self-framing — but a `read` returning `Ok(0)` must mean
/// the peer has closed its write half for good, matching the usual POSIX
/// read-EOF convention.
#[async_trait]
pub trait Transport: Send {
    /// Read at least one byte into `buf`, returning the number written.
    /// Returns `Ok(0)` only on a clean peer close.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write the entirety of `buf`, looping internally on short writes.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

/// One end of an in-process duplex byte pipe.
///
/// Used for tests and for wiring a local reference serving session behind
/// the same transport contract a real remote peer would use.
pub struct DuplexPipe {
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
    pending: BytesMut,
}

impl DuplexPipe {
    /// Construct a connected pair. Each end's `read` observes what the
    /// other end `write_all`s, in order.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::unbounded();
        (
            Self {
                tx: a_tx,
                rx: b_rx,
                pending: BytesMut::new(),
            },
            Self {
                tx: b_tx,
                rx: a_rx,
                pending: BytesMut::new(),
            },
        )
    }
}

#[async_trait]
impl Transport for DuplexPipe {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_async().await {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(_) => return Ok(0), // peer dropped its sender: clean EOF
            }
        }

        let take = buf.len().min(self.pending.len());
        buf[..take].copy_from_slice(&self.pending[..take]);
        let _ = self.pending.split_to(take);
        Ok(take)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.tx
            .send_async(Bytes::copy_from_slice(buf))
            .await
            .map_err(|_| CoreError::PeerGone)
    }
}

/// Bridges a real `compio` stream onto [`Transport`].
pub mod compio_bridge {
    use super::{CoreError, Result, Transport};
    use async_trait::async_trait;
    use compio::buf::BufResult;
    use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// Wraps any `compio` async stream (TCP, Unix socket, pipe) so the
    /// endpoint can drive it through the borrow-based [`Transport`]
    /// contract.
    pub struct CompioTransport<S> {
        stream: S,
    }

    impl<S> CompioTransport<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        pub const fn new(stream: S) -> Self {
            Self { stream }
        }

        pub fn into_inner(self) -> S {
            self.stream
        }
    }

    #[async_trait]
    impl<S> Transport for CompioTransport<S>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            let scratch = vec![0u8; buf.len()];
            let BufResult(res, scratch) = self.stream.read(scratch).await;
            let n = res.map_err(CoreError::Io)?;
            buf[..n].copy_from_slice(&scratch[..n]);
            Ok(n)
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            let BufResult(res, _) = self.stream.write_all(buf.to_vec()).await;
            res.map_err(CoreError::Io)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[compio::test]
    async fn duplex_pipe_delivers_bytes_in_order() {
        let (mut a, mut b) = DuplexPipe::pair();
        a.write_all(b"hello").await.unwrap();
        a.write_all(b" world").await.unwrap();

        let mut buf = [0u8; 32];
        let n1 = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"hello");
        let n2 = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b" world");
    }

    #[compio::test]
    async fn read_reports_zero_after_peer_drop() {
        let (a, mut b) = DuplexPipe::pair();
        drop(a);
        let mut buf = [0u8; 8];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[compio::test]
    async fn short_reader_buffer_drains_over_multiple_calls() {
        let (mut a, mut b) = DuplexPipe::pair();
        a.write_all(b"0123456789").await.unwrap();

        let mut buf = [0u8; 4];
        let n1 = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n1], b"0123");
        let n2 = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n2], b"4567");
        let n3 = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n3], b"89");
    }
}

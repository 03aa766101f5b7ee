//! Connection handles shared by both providers.
//!
//! A [`Connection`] is an ordered, bidirectional byte stream split into a
//! [`ReadHalf`] and a [`WriteHalf`]. The halves can be moved into separate
//! tasks and later reunited so that exactly one owner closes the connection.
//!
//! Both halves support an optional deadline. Once set, an operation that has
//! not completed by the deadline fails with `io::ErrorKind::TimedOut`.

use super::error::deadline_exceeded;
use super::TransportKind;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Provider-specific receive side.
pub(crate) enum Reader {
    Tcp(OwnedReadHalf),
    Quic(quinn::RecvStream),
}

/// Provider-specific send side.
pub(crate) enum Writer {
    Tcp(OwnedWriteHalf),
    Quic {
        send: quinn::SendStream,
        conn: quinn::Connection,
        linger: Duration,
    },
}

impl AsyncRead for Reader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Reader::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            Reader::Quic(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Writer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Writer::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            Writer::Quic { send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Writer::Tcp(w) => Pin::new(w).poll_flush(cx),
            Writer::Quic { send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Writer::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            Writer::Quic { send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
        }
    }
}

/// Run `fut` against an optional deadline.
async fn with_deadline<T>(
    deadline: Option<Instant>,
    op: &'static str,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match deadline {
        None => fut.await,
        Some(at) if at <= Instant::now() => Err(deadline_exceeded(op)),
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(deadline_exceeded(op)),
        },
    }
}

/// Discard incoming data until the peer finishes its stream or it breaks.
async fn drain(recv: &mut quinn::RecvStream) {
    let mut discard = [0u8; 8192];
    while let Ok(Some(_)) = recv.read(&mut discard).await {}
}

/// Receive side of a [`Connection`].
pub struct ReadHalf {
    kind: TransportKind,
    remote_addr: SocketAddr,
    inner: Reader,
    deadline: Option<Instant>,
}

impl ReadHalf {
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer finished sending.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_deadline(self.deadline, "read", self.inner.read(buf)).await
    }

    /// Fill `buf` completely or fail; end-of-stream first is `UnexpectedEof`.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        with_deadline(self.deadline, "read", self.inner.read_exact(buf))
            .await
            .map(|_| ())
    }
}

/// Send side of a [`Connection`].
pub struct WriteHalf {
    kind: TransportKind,
    inner: Writer,
    deadline: Option<Instant>,
    closed: bool,
}

impl WriteHalf {
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Write all of `buf`.
    ///
    /// Returns `buf.len()` on success; a write never transfers part of the
    /// buffer silently.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write on closed connection",
            ));
        }
        with_deadline(self.deadline, "write", self.inner.write_all(buf)).await?;
        Ok(buf.len())
    }

    /// Finish the send direction and release the connection.
    ///
    /// Calling this more than once is a no-op. For QUIC the connection stays
    /// open until the peer closes it or the linger period ends, so the peer
    /// application can still read everything written before the call.
    pub async fn close(&mut self) {
        self.close_lingering(None).await;
    }

    /// Close, draining `recv` while lingering.
    ///
    /// A peer that has finished its own stream is done with the connection,
    /// so end-of-stream on `recv` ends the linger early.
    async fn close_lingering(&mut self, recv: Option<&mut Reader>) {
        if self.closed {
            return;
        }
        self.closed = true;

        match &mut self.inner {
            Writer::Tcp(w) => {
                if let Err(e) = w.shutdown().await {
                    trace!(error = %e, "tcp shutdown");
                }
            }
            Writer::Quic { send, conn, linger } => {
                let _ = send.finish();
                let peer_done = async {
                    match recv {
                        Some(Reader::Quic(recv)) => tokio::select! {
                            _ = conn.closed() => trace!("quic connection closed by peer"),
                            _ = drain(recv) => trace!("quic peer finished its stream"),
                        },
                        _ => {
                            conn.closed().await;
                        }
                    }
                };
                if tokio::time::timeout(*linger, peer_done).await.is_err() {
                    debug!(linger = ?linger, "quic linger expired");
                }
                conn.close(quinn::VarInt::from_u32(0), b"closed");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// An ordered, reliable, bidirectional byte stream from either provider.
pub struct Connection {
    reader: ReadHalf,
    writer: WriteHalf,
}

impl Connection {
    pub(crate) fn new(
        kind: TransportKind,
        remote_addr: SocketAddr,
        reader: Reader,
        writer: Writer,
    ) -> Self {
        Self {
            reader: ReadHalf {
                kind,
                remote_addr,
                inner: reader,
                deadline: None,
            },
            writer: WriteHalf {
                kind,
                inner: writer,
                deadline: None,
                closed: false,
            },
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.reader.kind
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.reader.remote_addr
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.reader.set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.writer.set_write_deadline(deadline);
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).await
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.reader.read_exact(buf).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf).await
    }

    /// Split into halves that can be driven from different tasks.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.reader, self.writer)
    }

    /// Rebuild a connection from the halves produced by `into_split`.
    pub fn reunite(reader: ReadHalf, writer: WriteHalf) -> Self {
        debug_assert_eq!(reader.kind, writer.kind);
        Self { reader, writer }
    }

    /// Close both directions. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.writer.closed {
            return;
        }
        debug!(kind = %self.kind(), peer = %self.remote_addr(), "Closing connection");
        self.writer.close_lingering(Some(&mut self.reader.inner)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_closed()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("kind", &self.kind())
            .field("remote_addr", &self.remote_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

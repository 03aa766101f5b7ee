//! Echo server.
//!
//! Every accepted connection gets its own task that reads up to one block
//! and writes the same bytes back until the peer finishes, an I/O error
//! occurs, or the server is cancelled. Idle connections sit in a blocking
//! wait on "data or cancellation"; nothing polls.
//!
//! One `EchoServer` can serve several listeners at once (one TCP, one QUIC
//! in listen mode); they share only the cancellation token.

use crate::transport::{Connection, Listener, TransportError};
use bytes::BytesMut;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct EchoServer {
    block_size: usize,
    cancel: CancellationToken,
    connections: TaskTracker,
}

impl EchoServer {
    pub fn new(block_size: usize, cancel: CancellationToken) -> Self {
        Self {
            block_size,
            cancel,
            connections: TaskTracker::new(),
        }
    }

    /// Accept connections from `listener` until cancelled.
    ///
    /// Returns once the accept loop stops; connection tasks keep running
    /// until they observe the cancellation themselves.
    pub async fn serve(&self, listener: Listener) {
        let kind = listener.kind();
        info!(%kind, addr = ?listener.local_addr().ok(), "Echo server listening");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        debug!(%kind, peer = %conn.remote_addr(), "Accepted connection");
                        let cancel = self.cancel.clone();
                        let block_size = self.block_size;
                        self.connections.spawn(async move {
                            echo_connection(conn, block_size, cancel).await;
                        });
                    }
                    Err(TransportError::Closed(_)) => {
                        warn!(%kind, "Listener closed");
                        break;
                    }
                    Err(e) => {
                        error!(%kind, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        listener.close();
        debug!(%kind, "Accept loop stopped");
    }

    /// Wait up to `grace` for every connection task to close its connection.
    ///
    /// Returns false if some were still running when the grace period ended.
    pub async fn wait_for_connections(&self, grace: Duration) -> bool {
        self.connections.close();
        tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_ok()
    }
}

/// Echo one connection until end-of-stream, error or cancellation.
///
/// Returns the number of bytes echoed.
async fn echo_connection(mut conn: Connection, block_size: usize, cancel: CancellationToken) -> u64 {
    let peer = conn.remote_addr();
    let mut buf = BytesMut::zeroed(block_size);
    let mut echoed = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = conn.read(&mut buf) => match result {
                Ok(0) => {
                    trace!(peer = %peer, "Connection closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "Read failed");
                    break;
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = conn.write(&buf[..n]) => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Write failed");
                    break;
                }
            }
        }

        echoed += n as u64;
        trace!(peer = %peer, bytes = n, "Copied back");
    }

    conn.close().await;
    debug!(peer = %peer, echoed, "Echo connection finished");
    echoed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{dial, is_timeout, listen, TransportKind, TransportOptions};
    use tokio::time::Instant;

    const BLOCK: usize = 65536;

    fn options() -> TransportOptions {
        TransportOptions {
            linger: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn hello_block() -> Vec<u8> {
        let mut block = b"hello-block-1".to_vec();
        block.resize(BLOCK, 0);
        block
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_echo_round_trip_on_both_transports() {
        let cancel = CancellationToken::new();
        let server = EchoServer::new(BLOCK, cancel.clone());

        // Both listeners run concurrently on the same server.
        let mut addrs = Vec::new();
        let mut loops = Vec::new();
        for kind in [TransportKind::ReliableDatagram, TransportKind::Stream] {
            let listener = listen(kind, "127.0.0.1:0", &options()).await.unwrap();
            addrs.push((kind, listener.local_addr().unwrap().to_string()));
            let server = server.clone();
            loops.push(tokio::spawn(async move { server.serve(listener).await }));
        }

        for (kind, addr) in addrs {
            let mut conn = dial(kind, &addr, &options()).await.unwrap();
            let block = hello_block();
            assert_eq!(conn.write(&block).await.unwrap(), BLOCK);

            let mut echoed = vec![0u8; BLOCK];
            conn.read_exact(&mut echoed).await.unwrap();
            assert_eq!(echoed, block, "{kind}: echo differs");
            conn.close().await;
        }

        cancel.cancel();
        for handle in loops {
            handle.await.unwrap();
        }
        assert!(server.wait_for_connections(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_cancel_closes_idle_connections() {
        for kind in [TransportKind::Stream, TransportKind::ReliableDatagram] {
            let cancel = CancellationToken::new();
            let server = EchoServer::new(1024, cancel.clone());
            let listener = listen(kind, "127.0.0.1:0", &options()).await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let serving = {
                let server = server.clone();
                tokio::spawn(async move { server.serve(listener).await })
            };

            let mut conn = dial(kind, &addr, &options()).await.unwrap();
            // One round trip so the server side connection task exists.
            conn.write(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();

            cancel.cancel();
            serving.await.unwrap();
            assert!(server.wait_for_connections(Duration::from_secs(5)).await);

            // The idle client sees the server's close, not a stall.
            conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(3)));
            match conn.read(&mut buf).await {
                Ok(n) => assert_eq!(n, 0, "{kind}"),
                Err(e) => assert!(!is_timeout(&e), "{kind}: server never closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_finish_ends_task() {
        let cancel = CancellationToken::new();
        let listener = listen(TransportKind::Stream, "127.0.0.1:0", &options())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            echo_connection(conn, 8, cancel).await
        });

        let mut conn = dial(TransportKind::Stream, &addr, &options()).await.unwrap();
        conn.write(b"0123456789abcdef").await.unwrap();
        let mut buf = [0u8; 16];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"0123456789abcdef");
        conn.close().await;

        let echoed = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, 16);
    }
}

//! Benchmark driver: floods one connection and measures throughput.
//!
//! Three tasks share a run:
//! - sender: writes zero-filled blocks as fast as the connection accepts them
//! - receiver: reads and discards whatever comes back
//! - reporter: prints both byte counters once per interval
//!
//! All of them stop when the cancellation token fires. I/O errors end only
//! the task that hit them; the run itself lasts until cancellation.

use crate::stats::{print_report, ByteCounters, Direction};
use crate::transport::{Connection, ReadHalf, WriteHalf};
use bytes::{Bytes, BytesMut};
use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Final totals of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub sent: u64,
    pub received: u64,
    pub elapsed: Duration,
}

pub struct BenchmarkDriver {
    block_size: usize,
    started: Instant,
    report_interval: Duration,
    counters: Arc<ByteCounters>,
}

impl BenchmarkDriver {
    /// Create a driver moving `block_size` bytes per I/O call.
    ///
    /// Elapsed time in reports is measured from `started`.
    pub fn new(block_size: NonZeroUsize, started: Instant) -> Self {
        Self {
            block_size: block_size.get(),
            started,
            report_interval: Duration::from_secs(1),
            counters: Arc::new(ByteCounters::new()),
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Live counters, readable while the run is in progress.
    pub fn counters(&self) -> Arc<ByteCounters> {
        Arc::clone(&self.counters)
    }

    /// Drive `conn` until `cancel` fires, then close it and print the final
    /// totals.
    pub async fn run(self, conn: Connection, cancel: CancellationToken) -> io::Result<Summary> {
        let block = zero_block(self.block_size).await?;
        let peer = conn.remote_addr();
        info!(peer = %peer, block_size = self.block_size, "Starting benchmark");

        let (reader, writer) = conn.into_split();
        let sender = tokio::spawn(send_loop(
            writer,
            block,
            Arc::clone(&self.counters),
            cancel.clone(),
        ));
        let receiver = tokio::spawn(receive_loop(
            reader,
            self.block_size,
            Arc::clone(&self.counters),
            cancel.clone(),
        ));
        let reporter = tokio::spawn(report_loop(
            Arc::clone(&self.counters),
            self.started,
            self.report_interval,
            cancel.clone(),
        ));

        cancel.cancelled().await;

        let halves = (sender.await, receiver.await);
        if let Err(e) = reporter.await {
            warn!(error = %e, "Reporter task failed");
        }

        let elapsed = self.started.elapsed();
        println!("Quit now, final result:");
        print_report(&self.counters, elapsed);

        match halves {
            (Ok(writer), Ok(reader)) => Connection::reunite(reader, writer).close().await,
            (sent, recv) => {
                // whichever half survived is dropped, which releases the socket
                warn!(
                    sender_ok = sent.is_ok(),
                    receiver_ok = recv.is_ok(),
                    "I/O task failed; connection dropped without orderly close"
                );
            }
        }

        Ok(Summary {
            sent: self.counters.sent(),
            received: self.counters.received(),
            elapsed,
        })
    }
}

/// A block of `size` bytes pulled from a zero generator.
async fn zero_block(size: usize) -> io::Result<Bytes> {
    let mut block = BytesMut::zeroed(size);
    tokio::io::repeat(0).read_exact(&mut block).await?;
    Ok(block.freeze())
}

async fn send_loop(
    mut writer: WriteHalf,
    block: Bytes,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
) -> WriteHalf {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = writer.write(&block) => match result {
                Ok(n) => counters.add(Direction::Sent, n as u64),
                Err(e) => {
                    debug!(error = %e, "Send loop stopped");
                    break;
                }
            },
        }
    }
    writer
}

async fn receive_loop(
    mut reader: ReadHalf,
    block_size: usize,
    counters: Arc<ByteCounters>,
    cancel: CancellationToken,
) -> ReadHalf {
    let mut buf = BytesMut::zeroed(block_size);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("Peer finished sending");
                    break;
                }
                Ok(n) => counters.add(Direction::Recv, n as u64),
                Err(e) => {
                    debug!(error = %e, "Receive loop stopped");
                    break;
                }
            },
        }
    }
    reader
}

async fn report_loop(
    counters: Arc<ByteCounters>,
    started: Instant,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => print_report(&counters, started.elapsed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoServer;
    use crate::transport::{dial, listen, TransportKind, TransportOptions};
    use tokio_test::assert_ok;

    const KINDS: [TransportKind; 2] = [TransportKind::Stream, TransportKind::ReliableDatagram];

    fn block(size: usize) -> NonZeroUsize {
        NonZeroUsize::new(size).unwrap()
    }

    fn options() -> TransportOptions {
        TransportOptions {
            linger: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_zero_block() {
        let block = zero_block(4096).await.unwrap();
        assert_eq!(block.len(), 4096);
        assert!(block.iter().all(|&b| b == 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_benchmark_against_echo_server() {
        for kind in KINDS {
            let shutdown = CancellationToken::new();
            let listener = listen(kind, "127.0.0.1:0", &options()).await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let server = EchoServer::new(16 * 1024, shutdown.clone());
            let serving = tokio::spawn(async move { server.serve(listener).await });

            let conn = dial(kind, &addr, &options()).await.unwrap();
            let driver = BenchmarkDriver::new(block(16 * 1024), Instant::now())
                .with_report_interval(Duration::from_millis(200));
            let counters = driver.counters();
            let cancel = CancellationToken::new();
            let run = tokio::spawn(driver.run(conn, cancel.clone()));

            // Counters never go backwards while the run is live.
            let mut last = (0, 0);
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let now = (counters.sent(), counters.received());
                assert!(now.0 >= last.0 && now.1 >= last.1, "{kind}: counters went backwards");
                last = now;
            }

            cancel.cancel();
            let summary = assert_ok!(run.await.unwrap());
            assert!(summary.sent > 0, "{kind}: nothing sent");
            assert!(summary.received > 0, "{kind}: nothing echoed");
            assert!(summary.received <= summary.sent, "{kind}: received more than sent");

            shutdown.cancel();
            serving.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_after_peer_closed() {
        for kind in KINDS {
            let listener = listen(kind, "127.0.0.1:0", &options()).await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let peer = tokio::spawn(async move {
                let mut conn = listener.accept().await.unwrap();
                conn.close().await;
            });

            let conn = dial(kind, &addr, &options()).await.unwrap();
            let cancel = CancellationToken::new();
            let run = tokio::spawn(BenchmarkDriver::new(block(1024), Instant::now()).run(conn, cancel.clone()));

            peer.await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
            // Cancelling twice is harmless.
            cancel.cancel();

            let summary = tokio::time::timeout(Duration::from_secs(5), run)
                .await
                .expect("driver hung after peer close")
                .unwrap()
                .unwrap();
            assert_eq!(summary.received, 0, "{kind}");
        }
    }
}

//! Concurrent delivery stress harness.
//!
//! N clients each dial the harness's own listener and write M chunks of C
//! bytes. Chunk `i` is the window `source[i..i + C]` of one seeded random
//! buffer, so neighbouring chunks overlap and any reordering, truncation or
//! duplication shows up as a mismatch. Every accepted connection is verified
//! by its own task against the same windows.
//!
//! The first failure of any kind aborts the whole run.

use crate::transport::{
    dial, listen, Connection, Listener, TransportError, TransportKind, TransportOptions,
};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Parameters of one stress run.
#[derive(Debug, Clone)]
pub struct StressConfig {
    pub kind: TransportKind,
    /// Listen address; port 0 picks a free port.
    pub address: String,
    pub connections: usize,
    pub iterations: usize,
    pub chunk_size: usize,
    pub source_len: usize,
    pub seed: u64,
    /// Longest a single chunk read or write may take before the run fails.
    pub stall_timeout: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            address: "127.0.0.1:0".to_string(),
            connections: 4,
            iterations: 100,
            chunk_size: 1024,
            source_len: 200_000,
            seed: 0x5eed,
            stall_timeout: Duration::from_secs(10),
        }
    }
}

impl StressConfig {
    /// Check the parameters describe a run that can actually execute.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |reason: String| Err(HarnessError::InvalidParameters(reason));
        if self.connections == 0 {
            return invalid("connection count must be at least 1".into());
        }
        if self.iterations == 0 {
            return invalid("iteration count must be at least 1".into());
        }
        if self.chunk_size == 0 {
            return invalid("chunk size must be at least 1".into());
        }
        let needed = self.iterations - 1 + self.chunk_size;
        if self.source_len < needed {
            return invalid(format!(
                "source buffer of {} bytes is too small for {} iterations of {} bytes (need {})",
                self.source_len, self.iterations, self.chunk_size, needed
            ));
        }
        Ok(())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct StressReport {
    pub connections: usize,
    pub iterations: usize,
    pub chunk_size: usize,
    pub bytes_verified: u64,
    pub elapsed: Duration,
}

impl std::fmt::Display for StressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ok: {} connections x {} iterations x {} bytes verified ({} bytes in {:.2} sec)",
            self.connections,
            self.iterations,
            self.chunk_size,
            self.bytes_verified,
            self.elapsed.as_secs_f64()
        )
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid stress parameters: {0}")]
    InvalidParameters(String),

    #[error("listener: {0}")]
    Listen(#[source] TransportError),

    #[error("accepting connection {conn}: {source}")]
    Accept {
        conn: usize,
        #[source]
        source: TransportError,
    },

    #[error("client {conn}: dial failed: {source}")]
    Dial {
        conn: usize,
        #[source]
        source: TransportError,
    },

    #[error("client {conn}, iteration {iteration}: write failed: {source}")]
    Write {
        conn: usize,
        iteration: usize,
        #[source]
        source: io::Error,
    },

    #[error("client {conn}, iteration {iteration}: wrote {written} of {expected} bytes")]
    ShortWrite {
        conn: usize,
        iteration: usize,
        written: usize,
        expected: usize,
    },

    #[error("connection {conn}, iteration {iteration}: read failed: {source}")]
    Read {
        conn: usize,
        iteration: usize,
        #[source]
        source: io::Error,
    },

    #[error("connection {conn}, iteration {iteration}: data mismatch at byte {offset}")]
    Mismatch {
        conn: usize,
        iteration: usize,
        offset: usize,
    },

    #[error("stress task failed: {0}")]
    Task(#[from] JoinError),

    #[error("cancelled")]
    Cancelled,
}

/// Deterministic source buffer for a seed.
pub fn source_buffer(len: usize, seed: u64) -> Bytes {
    let mut buf = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Run the harness to completion or first failure.
pub async fn run(
    config: &StressConfig,
    options: &TransportOptions,
    cancel: CancellationToken,
) -> Result<StressReport, HarnessError> {
    config.validate()?;
    let started = Instant::now();
    let source = source_buffer(config.source_len, config.seed);

    let listener = listen(config.kind, &config.address, options)
        .await
        .map_err(HarnessError::Listen)?;
    let addr = listener
        .local_addr()
        .map_err(|source| {
            HarnessError::Listen(TransportError::Io {
                kind: config.kind,
                source,
            })
        })?
        .to_string();
    info!(
        kind = %config.kind,
        addr = %addr,
        connections = config.connections,
        iterations = config.iterations,
        chunk_size = config.chunk_size,
        "Starting stress run"
    );

    let work = Workload {
        source,
        iterations: config.iterations,
        chunk_size: config.chunk_size,
        stall_timeout: config.stall_timeout,
    };

    let mut tasks = RunTasks::new();
    for conn in 0..config.connections {
        tasks.clients.spawn(client(
            conn,
            config.kind,
            addr.clone(),
            options.clone(),
            work.clone(),
        ));
    }
    tasks
        .accept_all(&listener, config.connections, options.connect_timeout, &work, &cancel)
        .await?;
    tasks.finish(&cancel).await?;
    listener.close();

    let report = StressReport {
        connections: config.connections,
        iterations: config.iterations,
        chunk_size: config.chunk_size,
        bytes_verified: tasks.bytes_verified,
        elapsed: started.elapsed(),
    };
    info!(bytes = report.bytes_verified, elapsed = ?report.elapsed, "Stress run passed");
    Ok(report)
}

/// Every task of one run, plus the bytes finished verifiers confirmed.
///
/// Dropping the task sets aborts whatever is still running, so an early
/// return tears down the rest of the run.
struct RunTasks {
    clients: JoinSet<Result<(), HarnessError>>,
    verifiers: JoinSet<Result<u64, HarnessError>>,
    bytes_verified: u64,
}

impl RunTasks {
    fn new() -> Self {
        Self {
            clients: JoinSet::new(),
            verifiers: JoinSet::new(),
            bytes_verified: 0,
        }
    }

    /// Accept `count` connections, starting a verifier for each.
    ///
    /// Each accept gets `accept_timeout` from the previous one. Finished
    /// clients and verifiers are collected meanwhile, so the first failure
    /// ends the phase.
    async fn accept_all(
        &mut self,
        listener: &Listener,
        count: usize,
        accept_timeout: Duration,
        work: &Workload,
        cancel: &CancellationToken,
    ) -> Result<(), HarnessError> {
        let mut accepted = 0;
        let mut deadline = Instant::now() + accept_timeout;
        while accepted < count {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                Some(done) = self.clients.join_next() => done??,
                Some(done) = self.verifiers.join_next() => self.bytes_verified += done??,
                result = accept_before(listener, accepted, deadline) => {
                    let conn = result?;
                    debug!(conn = accepted, peer = %conn.remote_addr(), "Accepted stress connection");
                    self.verifiers.spawn(verifier(accepted, conn, work.clone()));
                    accepted += 1;
                    deadline = Instant::now() + accept_timeout;
                }
            }
        }
        Ok(())
    }

    /// Wait for every client and verifier to finish.
    async fn finish(&mut self, cancel: &CancellationToken) -> Result<(), HarnessError> {
        while !self.clients.is_empty() || !self.verifiers.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HarnessError::Cancelled),
                Some(done) = self.clients.join_next() => done??,
                Some(done) = self.verifiers.join_next() => self.bytes_verified += done??,
            }
        }
        Ok(())
    }
}

/// What every connection sends and expects.
#[derive(Clone)]
struct Workload {
    source: Bytes,
    iterations: usize,
    chunk_size: usize,
    stall_timeout: Duration,
}

impl Workload {
    /// Chunk `iteration`: the window of the source starting at that offset.
    fn chunk(&self, iteration: usize) -> &[u8] {
        &self.source[iteration..iteration + self.chunk_size]
    }
}

/// Accept connection number `conn`, failing if none arrives by `deadline`.
async fn accept_before(
    listener: &Listener,
    conn: usize,
    deadline: Instant,
) -> Result<Connection, HarnessError> {
    match tokio::time::timeout_at(deadline, listener.accept()).await {
        Ok(result) => result.map_err(|source| HarnessError::Accept { conn, source }),
        Err(_) => Err(HarnessError::Accept {
            conn,
            source: TransportError::Io {
                kind: listener.kind(),
                source: io::Error::new(io::ErrorKind::TimedOut, "no connection arrived in time"),
            },
        }),
    }
}

async fn client(
    conn_index: usize,
    kind: TransportKind,
    addr: String,
    options: TransportOptions,
    work: Workload,
) -> Result<(), HarnessError> {
    let mut conn = dial(kind, &addr, &options)
        .await
        .map_err(|source| HarnessError::Dial {
            conn: conn_index,
            source,
        })?;

    for iteration in 0..work.iterations {
        let chunk = work.chunk(iteration);
        conn.set_write_deadline(Some(Instant::now() + work.stall_timeout));
        let written = conn
            .write(chunk)
            .await
            .map_err(|source| HarnessError::Write {
                conn: conn_index,
                iteration,
                source,
            })?;
        if written != work.chunk_size {
            return Err(HarnessError::ShortWrite {
                conn: conn_index,
                iteration,
                written,
                expected: work.chunk_size,
            });
        }
    }

    conn.close().await;
    debug!(conn = conn_index, "Client done sending");
    Ok(())
}

async fn verifier(conn_index: usize, mut conn: Connection, work: Workload) -> Result<u64, HarnessError> {
    let mut buf = vec![0u8; work.chunk_size];

    for iteration in 0..work.iterations {
        conn.set_read_deadline(Some(Instant::now() + work.stall_timeout));
        conn.read_exact(&mut buf)
            .await
            .map_err(|source| HarnessError::Read {
                conn: conn_index,
                iteration,
                source,
            })?;

        if let Some(offset) = buf
            .iter()
            .zip(work.chunk(iteration))
            .position(|(a, b)| a != b)
        {
            return Err(HarnessError::Mismatch {
                conn: conn_index,
                iteration,
                offset,
            });
        }
    }

    conn.close().await;
    debug!(conn = conn_index, "Verifier done receiving");
    Ok((work.iterations * work.chunk_size) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransportOptions {
        TransportOptions {
            linger: Duration::from_secs(5),
            ..Default::default()
        }
    }

    fn workload(seed: u64, iterations: usize, chunk_size: usize) -> Workload {
        Workload {
            source: source_buffer(4096, seed),
            iterations,
            chunk_size,
            stall_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_source_buffer_is_deterministic() {
        let a = source_buffer(1000, 7);
        let b = source_buffer(1000, 7);
        let c = source_buffer(1000, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 1000);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        let ok = StressConfig::default();
        assert!(ok.validate().is_ok());

        for bad in [
            StressConfig { connections: 0, ..ok.clone() },
            StressConfig { iterations: 0, ..ok.clone() },
            StressConfig { chunk_size: 0, ..ok.clone() },
            StressConfig { source_len: 1122, ..ok.clone() },
        ] {
            assert!(matches!(
                bad.validate(),
                Err(HarnessError::InvalidParameters(_))
            ));
        }

        // Exactly large enough for the last window.
        let tight = StressConfig { source_len: 1123, ..ok };
        assert!(tight.validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_small_scale_stress_on_both_transports() {
        for kind in [TransportKind::Stream, TransportKind::ReliableDatagram] {
            let config = StressConfig {
                kind,
                ..Default::default()
            };
            let report = run(&config, &options(), CancellationToken::new())
                .await
                .unwrap_or_else(|e| panic!("{kind}: {e}"));
            assert_eq!(report.connections, 4);
            assert_eq!(report.bytes_verified, 4 * 100 * 1024);
        }
    }

    #[tokio::test]
    async fn test_single_byte_chunks() {
        let config = StressConfig {
            connections: 1,
            iterations: 1,
            chunk_size: 1,
            source_len: 1,
            ..Default::default()
        };
        let report = run(&config, &options(), CancellationToken::new()).await.unwrap();
        assert_eq!(report.bytes_verified, 1);
    }

    #[tokio::test]
    async fn test_corrupted_stream_is_reported() {
        let listener = listen(TransportKind::Stream, "127.0.0.1:0", &options())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let sender = tokio::spawn(async move {
            let mut conn = dial(TransportKind::Stream, &addr, &options()).await.unwrap();
            let mut data = source_buffer(4096, 1)[0..64].to_vec();
            data.extend_from_slice(&source_buffer(4096, 1)[1..65]);
            data[64 + 10] ^= 0xff;
            conn.write(&data).await.unwrap();
            conn.close().await;
        });

        let conn = listener.accept().await.unwrap();
        let err = verifier(3, conn, workload(1, 2, 64)).await.unwrap_err();
        match err {
            HarnessError::Mismatch {
                conn,
                iteration,
                offset,
            } => {
                assert_eq!((conn, iteration, offset), (3, 1, 10));
            }
            other => panic!("unexpected error: {other}"),
        }
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_stream_is_reported() {
        let listener = listen(TransportKind::Stream, "127.0.0.1:0", &options())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let sender = tokio::spawn(async move {
            let mut conn = dial(TransportKind::Stream, &addr, &options()).await.unwrap();
            conn.write(&source_buffer(4096, 2)[0..100]).await.unwrap();
            conn.close().await;
        });

        let conn = listener.accept().await.unwrap();
        let err = verifier(0, conn, workload(2, 3, 100)).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Read { conn: 0, iteration: 1, .. }
        ));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_fails_within_stall_timeout() {
        for kind in [TransportKind::Stream, TransportKind::ReliableDatagram] {
            let listener = listen(kind, "127.0.0.1:0", &options()).await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();

            // Sends the first chunk, then goes quiet without closing.
            let sender = tokio::spawn(async move {
                let mut conn = dial(kind, &addr, &options()).await.unwrap();
                conn.write(&source_buffer(4096, 4)[0..64]).await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
                drop(conn);
            });

            let conn = listener.accept().await.unwrap();
            let work = Workload {
                stall_timeout: Duration::from_millis(300),
                ..workload(4, 5, 64)
            };
            let started = Instant::now();
            let err = verifier(0, conn, work).await.unwrap_err();
            assert!(started.elapsed() < Duration::from_secs(2), "{kind}: stall not bounded");
            match err {
                HarnessError::Read {
                    conn: 0,
                    iteration: 1,
                    source,
                } => assert!(crate::transport::is_timeout(&source), "{kind}: {source}"),
                other => panic!("{kind}: unexpected error: {other}"),
            }
            sender.abort();
        }
    }

    #[tokio::test]
    async fn test_accept_phase_is_bounded() {
        let listener = listen(TransportKind::Stream, "127.0.0.1:0", &options())
            .await
            .unwrap();
        let started = Instant::now();
        let err = accept_before(&listener, 2, Instant::now() + Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, HarnessError::Accept { conn: 2, .. }));
    }

    #[tokio::test]
    async fn test_failed_verifier_aborts_accept_phase() {
        let listener = listen(TransportKind::Stream, "127.0.0.1:0", &options())
            .await
            .unwrap();
        let mut tasks = RunTasks::new();
        tasks.verifiers.spawn(async {
            Err(HarnessError::Mismatch {
                conn: 0,
                iteration: 7,
                offset: 3,
            })
        });

        // Nobody dials, so only the failed verifier can end the wait early.
        let started = Instant::now();
        let err = tasks
            .accept_all(
                &listener,
                2,
                Duration::from_secs(5),
                &workload(6, 1, 1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            err,
            HarnessError::Mismatch { conn: 0, iteration: 7, offset: 3 }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let config = StressConfig {
            // Nobody dials this many before the cancellation is seen.
            connections: 64,
            ..Default::default()
        };
        let result = run(&config, &options(), cancel).await;
        assert!(matches!(result, Err(HarnessError::Cancelled)));
    }
}

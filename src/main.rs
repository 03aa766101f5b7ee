//! transport-bench: throughput and integrity benchmark for QUIC and TCP
//!
//! Three modes:
//! - server: echo every connection on a QUIC and a TCP listener
//! - client: flood one connection and report throughput once per second
//! - stress: many concurrent connections, byte-exact ordered delivery checks
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod driver;
mod echo;
mod shutdown;
mod stats;
mod stress;
mod transport;

use config::{usage, Config, ConfigError, Mode};
use driver::BenchmarkDriver;
use echo::EchoServer;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transport::{TransportKind, TransportOptions};

/// Extra time, past the QUIC linger, that listen mode gives echo
/// connections to close on shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error>;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e @ ConfigError::MissingAddress(_)) => {
            let program = std::env::args().next().unwrap_or_else(|| "transport-bench".into());
            eprintln!("{e}");
            eprint!("{}", usage(&program));
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        block_size = config.block_size.get(),
        connect_timeout_ms = config.transport.connect_timeout.as_millis() as u64,
        "Starting transport-bench"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("benchmark error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("benchmark error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), BoxError> {
    let cancel = CancellationToken::new();
    shutdown::abort_on_sigabrt()?;
    shutdown::cancel_on_termination(cancel.clone())?;

    match &config.mode {
        Mode::Listen { udt_addr, tcp_addr } => {
            run_listen(&config, udt_addr, tcp_addr, cancel).await
        }
        Mode::Dial { remote_addr } => run_dial(&config, remote_addr, cancel).await,
        Mode::Stress { .. } => run_stress(&config, cancel).await,
    }
}

/// Echo on both transports until a termination signal.
async fn run_listen(
    config: &Config,
    udt_addr: &str,
    tcp_addr: &str,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    if config.transport_name.is_some() {
        warn!("Transport selection is ignored in server mode");
    }

    let options: &TransportOptions = &config.transport;
    let quic = transport::listen(TransportKind::ReliableDatagram, udt_addr, options).await?;
    let tcp = transport::listen(TransportKind::Stream, tcp_addr, options).await?;

    let server = EchoServer::new(config.block_size.get(), cancel.clone());
    let accept_loops = [quic, tcp].map(|listener| {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    });

    cancel.cancelled().await;
    println!("Quit now");

    for handle in accept_loops {
        if let Err(e) = handle.await {
            warn!(error = %e, "Accept loop failed");
        }
    }
    let grace = options.linger + SHUTDOWN_SLACK;
    if !server.wait_for_connections(grace).await {
        warn!(grace_secs = grace.as_secs(), "Echo connections still open at exit");
    }
    Ok(())
}

/// Flood one connection until a termination signal.
async fn run_dial(
    config: &Config,
    remote_addr: &str,
    cancel: CancellationToken,
) -> Result<(), BoxError> {
    let kind = config.transport_kind();
    let started = Instant::now();
    let conn = transport::dial(kind, remote_addr, &config.transport).await?;
    info!(%kind, peer = %conn.remote_addr(), "Connected");

    let summary = BenchmarkDriver::new(config.block_size, started)
        .run(conn, cancel)
        .await?;
    info!(
        sent = summary.sent,
        received = summary.received,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Benchmark finished"
    );
    Ok(())
}

/// Run the stress harness once and print its outcome.
async fn run_stress(config: &Config, cancel: CancellationToken) -> Result<(), BoxError> {
    let stress = config.stress_config();
    let report = stress::run(&stress, &config.transport, cancel).await?;
    println!("{report}");
    Ok(())
}

//! Reliable-datagram transport: QUIC over UDP.
//!
//! Each logical connection is one QUIC connection carrying a single
//! bidirectional stream. QUIC streams only become visible to the peer once
//! data flows, so the dialer writes a one-byte marker right after opening
//! the stream and the acceptor consumes it before handing the connection out.

use super::connection::{Connection, Reader, Writer};
use super::tls;
use super::{TransportError, TransportKind, TransportOptions};
use quinn::{Endpoint, Incoming, IdleTimeout};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const KIND: TransportKind = TransportKind::ReliableDatagram;

/// First byte on every stream, never surfaced to callers.
const OPEN_MARKER: u8 = 0x5a;

/// Established connections waiting for `accept`.
const ACCEPT_QUEUE: usize = 128;

/// Accepting side of the QUIC provider.
///
/// A background task takes every incoming connection and runs its handshake
/// on a task of its own, so a slow or silent peer never holds up the others.
pub(super) struct QuicAcceptor {
    endpoint: Endpoint,
    established: Mutex<mpsc::Receiver<Connection>>,
    stop: CancellationToken,
}

impl QuicAcceptor {
    pub(super) fn bind(
        addr: SocketAddr,
        address: &str,
        options: &TransportOptions,
    ) -> Result<Self, TransportError> {
        let mut server_config = tls::server_config()?;
        server_config.transport_config(Arc::new(transport_config(options)));

        let endpoint = Endpoint::server(server_config, addr).map_err(|source| {
            TransportError::Bind {
                kind: KIND,
                address: address.to_string(),
                source,
            }
        })?;

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        let stop = CancellationToken::new();
        tokio::spawn(accept_loop(
            endpoint.clone(),
            tx,
            options.connect_timeout,
            options.linger,
            stop.clone(),
        ));

        Ok(Self {
            endpoint,
            established: Mutex::new(rx),
            stop,
        })
    }

    /// Wait for the next fully established connection.
    ///
    /// A peer that fails its handshake is logged and skipped; only a closed
    /// listener ends the sequence.
    pub(super) async fn accept(&self) -> Result<Connection, TransportError> {
        self.established
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed(KIND))
    }

    pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    /// Stop taking new connections. Accepted ones stay open.
    pub(super) fn close(&self) {
        self.stop.cancel();
    }
}

impl Drop for QuicAcceptor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn accept_loop(
    endpoint: Endpoint,
    established: mpsc::Sender<Connection>,
    handshake_timeout: Duration,
    linger: Duration,
    stop: CancellationToken,
) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let established = established.clone();
                handshakes.spawn(async move {
                    let peer = incoming.remote_address();
                    match tokio::time::timeout(handshake_timeout, establish(incoming, linger)).await {
                        Ok(Ok(conn)) => {
                            debug!(peer = %peer, "quic connection accepted");
                            // a dropped receiver means the listener is gone
                            let _ = established.send(conn).await;
                        }
                        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Rejected incoming quic connection"),
                        Err(_) => warn!(peer = %peer, "Incoming quic connection timed out"),
                    }
                });
            }
            Some(_) = handshakes.join_next() => {}
        }
    }
    // dropping the set aborts handshakes still in flight
    debug!("quic accept loop stopped");
}

async fn establish(incoming: Incoming, linger: Duration) -> Result<Connection, TransportError> {
    let peer = incoming.remote_address();
    let handshake = |reason: String| TransportError::Handshake {
        kind: KIND,
        peer: peer.to_string(),
        reason,
    };

    let conn = incoming.await.map_err(|e| handshake(e.to_string()))?;
    let (send, mut recv) = conn.accept_bi().await.map_err(|e| handshake(e.to_string()))?;

    let mut marker = [0u8; 1];
    recv.read_exact(&mut marker)
        .await
        .map_err(|e| handshake(e.to_string()))?;
    if marker[0] != OPEN_MARKER {
        return Err(handshake(format!("unexpected stream marker {:#04x}", marker[0])));
    }

    Ok(Connection::new(
        KIND,
        peer,
        Reader::Quic(recv),
        Writer::Quic { send, conn, linger },
    ))
}

pub(super) async fn connect(
    addr: SocketAddr,
    address: &str,
    options: &TransportOptions,
) -> Result<Connection, TransportError> {
    let connect_error = |e: &dyn std::fmt::Display| TransportError::Connect {
        kind: KIND,
        address: address.to_string(),
        source: io::Error::other(e.to_string()),
    };

    let bind: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = Endpoint::client(bind).map_err(|source| TransportError::Bind {
        kind: KIND,
        address: bind.to_string(),
        source,
    })?;

    let mut client_config = tls::client_config()?;
    client_config.transport_config(Arc::new(transport_config(options)));
    endpoint.set_default_client_config(client_config);

    let conn = endpoint
        .connect(addr, tls::SERVER_NAME)
        .map_err(|e| connect_error(&e))?
        .await
        .map_err(|e| connect_error(&e))?;

    let (mut send, recv) = conn.open_bi().await.map_err(|e| connect_error(&e))?;
    send.write_all(&[OPEN_MARKER])
        .await
        .map_err(|e| connect_error(&e))?;

    debug!(peer = %addr, "quic connection established");
    Ok(Connection::new(
        KIND,
        addr,
        Reader::Quic(recv),
        Writer::Quic {
            send,
            conn,
            linger: options.linger,
        },
    ))
}

fn transport_config(options: &TransportOptions) -> quinn::TransportConfig {
    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(IdleTimeout::try_from(options.idle_timeout).ok());
    config.keep_alive_interval(Some(options.keep_alive));
    config
}

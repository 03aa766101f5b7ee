//! Connection providers.
//!
//! Two providers sit behind one contract:
//! - `Stream`: TCP
//! - `ReliableDatagram`: QUIC, a reliable ordered stream over UDP
//!
//! Both hand out [`Connection`]s from [`dial`] and [`Listener::accept`].
//! Nothing in this module knows about benchmarking.

mod connection;
mod error;
mod quic;
mod tcp;
mod tls;

pub use connection::{Connection, ReadHalf, WriteHalf};
pub use error::{is_timeout, TransportError};

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Which provider to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// TCP. Also the fallback for any unrecognized name.
    #[default]
    Stream,
    /// QUIC over UDP.
    ReliableDatagram,
}

impl TransportKind {
    /// Resolve a transport name.
    ///
    /// Unknown names fall back to [`TransportKind::Stream`] with a warning
    /// instead of failing.
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(name, fallback = %TransportKind::default(), "Unrecognized transport, using default");
            TransportKind::default()
        })
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "stream" => Ok(TransportKind::Stream),
            "udt" | "quic" | "datagram" | "reliable-datagram" => {
                Ok(TransportKind::ReliableDatagram)
            }
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("tcp"),
            TransportKind::ReliableDatagram => f.write_str("quic"),
        }
    }
}

/// Knobs shared by both providers.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound on establishing a connection, including the handshake.
    pub connect_timeout: Duration,
    /// QUIC idle timeout.
    pub idle_timeout: Duration,
    /// QUIC keep-alive interval; keeps silent connections from idling out.
    pub keep_alive: Duration,
    /// How long a QUIC close waits for the peer to acknowledge sent data.
    pub linger: Duration,
    /// TCP_NODELAY on stream connections.
    pub nodelay: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(5),
            linger: Duration::from_secs(10),
            nodelay: true,
        }
    }
}

/// Resolve `[host]:port`.
///
/// An empty host means every interface when `passive`, loopback otherwise.
async fn resolve(
    kind: TransportKind,
    address: &str,
    passive: bool,
) -> Result<SocketAddr, TransportError> {
    let invalid = |reason: String| TransportError::InvalidAddress {
        kind,
        address: address.to_string(),
        reason,
    };

    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        let ip = if passive {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        return Ok(SocketAddr::from((ip, port)));
    }

    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    tokio::net::lookup_host(address)
        .await
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses found".to_string()))
}

/// Connect to `address` using the given provider.
pub async fn dial(
    kind: TransportKind,
    address: &str,
    options: &TransportOptions,
) -> Result<Connection, TransportError> {
    debug!(%kind, address, "Dialing");
    let addr = resolve(kind, address, false).await?;

    let connect = async {
        match kind {
            TransportKind::Stream => {
                tcp::connect(addr, options)
                    .await
                    .map_err(|source| TransportError::Connect {
                        kind,
                        address: address.to_string(),
                        source,
                    })
            }
            TransportKind::ReliableDatagram => quic::connect(addr, address, options).await,
        }
    };

    let conn = tokio::time::timeout(options.connect_timeout, connect)
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            kind,
            address: address.to_string(),
            timeout_ms: options.connect_timeout.as_millis(),
        })??;

    debug!(%kind, peer = %conn.remote_addr(), "Connected");
    Ok(conn)
}

/// Bind a listener for the given provider on `address`.
pub async fn listen(
    kind: TransportKind,
    address: &str,
    options: &TransportOptions,
) -> Result<Listener, TransportError> {
    let addr = resolve(kind, address, true).await?;

    let inner = match kind {
        TransportKind::Stream => {
            ListenerInner::Tcp(tcp::TcpAcceptor::bind(addr, options).map_err(|source| {
                TransportError::Bind {
                    kind,
                    address: address.to_string(),
                    source,
                }
            })?)
        }
        TransportKind::ReliableDatagram => {
            ListenerInner::Quic(quic::QuicAcceptor::bind(addr, address, options)?)
        }
    };

    let listener = Listener { kind, inner };
    debug!(%kind, addr = ?listener.local_addr().ok(), "Listening");
    Ok(listener)
}

enum ListenerInner {
    Tcp(tcp::TcpAcceptor),
    Quic(quic::QuicAcceptor),
}

/// A bound listener producing accepted connections.
pub struct Listener {
    kind: TransportKind,
    inner: ListenerInner,
}

impl Listener {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        match &self.inner {
            ListenerInner::Tcp(l) => l.accept().await.map_err(|source| TransportError::Io {
                kind: self.kind,
                source,
            }),
            ListenerInner::Quic(l) => l.accept().await,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            ListenerInner::Tcp(l) => l.local_addr(),
            ListenerInner::Quic(l) => l.local_addr(),
        }
    }

    /// Stop accepting. TCP stops when the listener is dropped.
    pub fn close(&self) {
        if let ListenerInner::Quic(l) = &self.inner {
            l.close();
        }
    }
}

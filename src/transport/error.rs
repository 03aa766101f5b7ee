//! Error types for the connection providers.

use super::TransportKind;
use std::io;
use thiserror::Error;

/// Failure surfaced by `dial`, `listen` or `Listener::accept`.
///
/// Every variant that concerns a specific endpoint carries the transport
/// kind and the address as given by the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind}: invalid address '{address}': {reason}")]
    InvalidAddress {
        kind: TransportKind,
        address: String,
        reason: String,
    },

    #[error("{kind}: failed to bind {address}: {source}")]
    Bind {
        kind: TransportKind,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{kind}: failed to connect to {address}: {source}")]
    Connect {
        kind: TransportKind,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("{kind}: timed out connecting to {address} after {timeout_ms} ms")]
    ConnectTimeout {
        kind: TransportKind,
        address: String,
        timeout_ms: u128,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("{kind}: handshake with {peer} failed: {reason}")]
    Handshake {
        kind: TransportKind,
        peer: String,
        reason: String,
    },

    #[error("{0}: listener closed")]
    Closed(TransportKind),

    #[error("{kind}: {source}")]
    Io {
        kind: TransportKind,
        #[source]
        source: io::Error,
    },
}

/// Returns true when `err` is a deadline expiry rather than a closed or
/// broken connection.
pub fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// The error reads and writes fail with once their deadline has passed.
pub(crate) fn deadline_exceeded(op: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{op} deadline exceeded"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguishable() {
        assert!(is_timeout(&deadline_exceeded("read")));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::UnexpectedEof)));
        assert!(!is_timeout(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_error_carries_provider_context() {
        let err = TransportError::ConnectTimeout {
            kind: TransportKind::ReliableDatagram,
            address: "10.0.0.1:9000".to_string(),
            timeout_ms: 500,
        };
        let msg = err.to_string();
        assert!(msg.contains("quic"));
        assert!(msg.contains("10.0.0.1:9000"));
        assert!(msg.contains("500 ms"));
    }
}

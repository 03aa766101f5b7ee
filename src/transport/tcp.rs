//! Stream transport: plain TCP.

use super::connection::{Connection, Reader, Writer};
use super::{TransportKind, TransportOptions};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Listen backlog for the benchmark listener.
const BACKLOG: i32 = 1024;

/// Accepting side of the TCP provider.
pub(super) struct TcpAcceptor {
    listener: TcpListener,
    nodelay: bool,
}

impl TcpAcceptor {
    pub(super) fn bind(addr: SocketAddr, options: &TransportOptions) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        Ok(Self {
            listener,
            nodelay: options.nodelay,
        })
    }

    pub(super) async fn accept(&self) -> io::Result<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "tcp connection accepted");
        into_connection(stream, peer, self.nodelay)
    }

    pub(super) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

pub(super) async fn connect(addr: SocketAddr, options: &TransportOptions) -> io::Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    into_connection(stream, addr, options.nodelay)
}

fn into_connection(stream: TcpStream, peer: SocketAddr, nodelay: bool) -> io::Result<Connection> {
    stream.set_nodelay(nodelay)?;
    let (r, w) = stream.into_split();
    Ok(Connection::new(
        TransportKind::Stream,
        peer,
        Reader::Tcp(r),
        Writer::Tcp(w),
    ))
}

/// Build a non-blocking listening socket.
///
/// SO_REUSEADDR lets a restarted listener rebind while old connections sit
/// in TIME_WAIT; a second live listener on the same port still fails.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), &Default::default())
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_second_bind_on_same_port_fails() {
        let options = TransportOptions::default();
        let first = TcpAcceptor::bind("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(TcpAcceptor::bind(addr, &options).is_err());
    }
}

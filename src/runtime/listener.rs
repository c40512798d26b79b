//! Passive socket setup and accept.
//!
//! The listener never carries data; it exists only to produce active
//! sockets. Accept is called after readiness is confirmed, so `WouldBlock`
//! just means the pending-connection queue drained.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Wrapper around the listening socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind the passive socket at `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
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
        socket.listen(1024)?;

        Ok(Self {
            inner: TcpListener::from_std(socket.into()),
        })
    }

    /// Address the listener is bound to (resolves port 0 to the real port).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept the next pending connection.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    /// The underlying event source for poll registration.
    pub(crate) fn source(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

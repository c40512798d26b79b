//! Per-connection state and the registry of active connections.
//!
//! The registry is owned and mutated by the event loop thread only. During
//! a dispatch pass the loop collects ids to retire and applies removal
//! after the pass, so the set being dispatched is never mutated mid-pass.

use crate::runtime::frame::FrameReader;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;

/// A single accepted client connection.
///
/// Dropping the connection closes its socket; removal from the registry is
/// the only place that happens.
#[derive(Debug)]
pub struct Connection {
    /// The connection's socket.
    pub stream: TcpStream,
    /// Peer address captured at accept time.
    pub peer: SocketAddr,
    /// Frame reassembly state for this connection's byte stream.
    pub reader: FrameReader,
}

impl Connection {
    /// Create a connection ready to read its first frame.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            reader: FrameReader::new(),
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove; the slab key doubles as the
/// connection's poll token.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, returning it so the caller can deregister its
    /// socket before drop closes it. Idempotent: removing an absent id
    /// returns `None`.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        if self.connections.contains(id) {
            Some(self.connections.remove(id))
        } else {
            None
        }
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

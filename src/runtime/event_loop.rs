//! The readiness loop.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking accept/read syscalls. Uses epoll on Linux, kqueue
//! on macOS. One thread owns the poll, the registry, and every connection;
//! there is no locking because there is no concurrent mutation.
//!
//! Event order within a batch is unspecified, so each event is handled
//! self-contained: stale events for retired connections are ignored, and
//! connections marked for close during a batch are removed only after the
//! batch completes.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::frame::{CloseReason, Progress};
use crate::runtime::listener::Listener;
use crate::runtime::sink::FrameSink;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Poll event batch size per iteration.
const EVENT_CAPACITY: usize = 1024;

/// Single-threaded event loop driving one listener and all of its
/// accepted connections.
pub struct EventLoop<S: FrameSink> {
    poll: Poll,
    events: Events,
    listener: Listener,
    connections: ConnectionRegistry,
    sink: S,
}

impl<S: FrameSink> EventLoop<S> {
    /// Create the loop and register the listener for read interest.
    pub fn new(mut listener: Listener, sink: S, max_connections: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            connections: ConnectionRegistry::new(max_connections),
            sink,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until the readiness wait itself fails.
    ///
    /// Per-connection failures (accept errors, read errors, peer closes,
    /// truncated frames) are absorbed here and never cross connections. A
    /// poll failure is the one fatal condition: the error is logged and
    /// returned, and dropping the loop closes the listener and every
    /// remaining connection.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Readiness wait failed, stopping server");
                return Err(e);
            }

            // Connections to retire, applied after the dispatch pass so the
            // set being dispatched is never mutated mid-pass.
            let mut to_close: Vec<usize> = Vec::new();

            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        accept_ready(&self.listener, &self.poll, &mut self.connections);
                    }
                    Token(conn_id) => {
                        connection_ready(
                            conn_id,
                            event,
                            &mut self.connections,
                            &mut self.sink,
                            &mut to_close,
                        );
                    }
                }
            }

            for conn_id in to_close {
                close_connection(&self.poll, &mut self.connections, conn_id);
            }
        }
    }
}

/// Drain the pending-connection queue.
///
/// A failed accept never terminates the server; the error is logged and the
/// listener waits for the next readiness notification.
fn accept_ready(listener: &Listener, poll: &Poll, connections: &mut ConnectionRegistry) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_id = match connections.insert(Connection::new(stream, peer)) {
                    Some(id) => id,
                    None => {
                        // Dropping the stream closes it.
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        continue;
                    }
                };

                // Re-borrow after insert to register the stored stream.
                let conn = match connections.get_mut(conn_id) {
                    Some(conn) => conn,
                    None => continue,
                };
                if let Err(e) =
                    poll.registry()
                        .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
                {
                    error!(conn_id, error = %e, "Failed to register connection");
                    connections.remove(conn_id);
                    continue;
                }

                info!(
                    conn_id,
                    peer = %peer,
                    active = connections.len(),
                    "Accepted connection"
                );
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "Accept error");
                break;
            }
        }
    }
}

/// Dispatch one readiness event for a connection.
///
/// Exceptional conditions close the connection without reading. Readable
/// conditions drive the frame reader until the socket has no more data
/// (edge-triggered notification requires draining); every completed frame
/// goes to the sink before the next byte is read.
fn connection_ready<S: FrameSink>(
    conn_id: usize,
    event: &mio::event::Event,
    connections: &mut ConnectionRegistry,
    sink: &mut S,
    to_close: &mut Vec<usize>,
) {
    // Already marked earlier in this batch, or retired by a previous batch.
    if to_close.contains(&conn_id) || !connections.contains(conn_id) {
        return;
    }
    let conn = match connections.get_mut(conn_id) {
        Some(conn) => conn,
        None => return,
    };

    if event.is_error() {
        warn!(
            conn_id,
            peer = %conn.peer,
            state = ?conn.reader.state(),
            "Exceptional condition on connection"
        );
        to_close.push(conn_id);
        return;
    }

    if !event.is_readable() {
        return;
    }

    loop {
        match conn.reader.read_step(&mut conn.stream) {
            Progress::Frame(payload) => {
                debug!(conn_id, len = payload.len(), "Frame assembled");
                sink.on_frame(conn_id, payload);
            }
            Progress::Pending => {}
            Progress::WouldBlock => break,
            Progress::Closed(reason) => {
                match reason {
                    CloseReason::PeerClosed => {
                        debug!(conn_id, peer = %conn.peer, "Peer closed connection");
                    }
                    CloseReason::TruncatedFrame => {
                        debug!(
                            conn_id,
                            peer = %conn.peer,
                            "Peer closed mid-frame, partial frame discarded"
                        );
                    }
                    CloseReason::Error(e) => {
                        warn!(conn_id, peer = %conn.peer, error = %e, "Read failed");
                    }
                }
                to_close.push(conn_id);
                break;
            }
        }
    }
}

/// Retire a connection: deregister from the poll and drop it, which closes
/// the socket. Runs only from the post-batch removal pass.
fn close_connection(poll: &Poll, connections: &mut ConnectionRegistry, conn_id: usize) {
    if let Some(mut conn) = connections.remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        debug!(conn_id, peer = %conn.peer, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Sink that records every frame with its connection id.
    #[derive(Clone, Default)]
    struct CaptureSink {
        frames: Arc<Mutex<Vec<(usize, Vec<u8>)>>>,
    }

    impl FrameSink for CaptureSink {
        fn on_frame(&mut self, conn_id: usize, payload: Bytes) {
            self.frames.lock().unwrap().push((conn_id, payload.to_vec()));
        }
    }

    /// Start a server on an ephemeral port; the loop thread runs until the
    /// test process exits.
    fn spawn_server(sink: CaptureSink) -> SocketAddr {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut event_loop = EventLoop::new(listener, sink, 64).unwrap();
        let addr = event_loop.local_addr().unwrap();
        thread::spawn(move || {
            let _ = event_loop.run();
        });
        addr
    }

    fn wait_for_frames(
        frames: &Arc<Mutex<Vec<(usize, Vec<u8>)>>>,
        count: usize,
    ) -> Vec<(usize, Vec<u8>)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let got = frames.lock().unwrap();
                if got.len() >= count {
                    return got.clone();
                }
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {count} frame(s)"
            );
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut wire = (payload.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(payload);
        wire
    }

    #[test]
    fn test_single_write_single_frame() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .write_all(&[0x00, 0x00, 0x00, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F])
            .unwrap();

        let got = wait_for_frames(&frames, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"hello");
    }

    #[test]
    fn test_payload_split_across_writes() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&7u32.to_be_bytes()).unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"pay").unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(b"load").unwrap();

        let got = wait_for_frames(&frames, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"payload");
    }

    #[test]
    fn test_silent_disconnect_emits_nothing() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        // Connect and disconnect without sending a byte.
        drop(StdTcpStream::connect(addr).unwrap());
        thread::sleep(Duration::from_millis(100));

        // Other connections are unaffected.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&frame_bytes(b"after")).unwrap();

        let got = wait_for_frames(&frames, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"after");
    }

    #[test]
    fn test_three_clients_same_window() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        let mut clients: Vec<StdTcpStream> = (0..3)
            .map(|_| StdTcpStream::connect(addr).unwrap())
            .collect();
        for (i, client) in clients.iter_mut().enumerate() {
            let payload = format!("client-{i}");
            client.write_all(&frame_bytes(payload.as_bytes())).unwrap();
        }

        let got = wait_for_frames(&frames, 3);
        assert_eq!(got.len(), 3);

        // Each frame arrives intact and on its own connection.
        let payloads: HashSet<Vec<u8>> = got.iter().map(|(_, p)| p.clone()).collect();
        for i in 0..3 {
            assert!(payloads.contains(format!("client-{i}").as_bytes()));
        }
        let conn_ids: HashSet<usize> = got.iter().map(|(id, _)| *id).collect();
        assert_eq!(conn_ids.len(), 3);
    }

    #[test]
    fn test_truncated_frame_not_emitted() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        // Declare 100 bytes, deliver 4, disconnect.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&100u32.to_be_bytes()).unwrap();
        client.write_all(b"oops").unwrap();
        drop(client);
        thread::sleep(Duration::from_millis(100));

        // The truncated frame is dropped silently; a later client's frame
        // still comes through.
        let mut client = StdTcpStream::connect(addr).unwrap();
        client.write_all(&frame_bytes(b"intact")).unwrap();

        let got = wait_for_frames(&frames, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, b"intact");
    }

    #[test]
    fn test_multiple_frames_one_connection() {
        let sink = CaptureSink::default();
        let frames = Arc::clone(&sink.frames);
        let addr = spawn_server(sink);

        let mut client = StdTcpStream::connect(addr).unwrap();
        let mut wire = frame_bytes(b"");
        wire.extend_from_slice(&frame_bytes(b"one"));
        wire.extend_from_slice(&frame_bytes(b"two"));
        client.write_all(&wire).unwrap();

        let got = wait_for_frames(&frames, 3);
        let conn_id = got[0].0;
        assert!(got.iter().all(|(id, _)| *id == conn_id));
        let payloads: Vec<&[u8]> = got.iter().map(|(_, p)| p.as_slice()).collect();
        assert_eq!(payloads, vec![&b""[..], &b"one"[..], &b"two"[..]]);
    }
}

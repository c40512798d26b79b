//! Single-threaded readiness runtime.
//!
//! One thread owns everything: the poll, the listener, the connection
//! registry, and every connection's frame reader. Components:
//! - `Listener`: passive socket setup and accept
//! - `Connection` / `ConnectionRegistry`: per-peer state, slab-backed
//! - `FrameReader`: incremental length-prefixed frame reassembly
//! - `EventLoop`: readiness dispatch and connection lifecycle
//! - `FrameSink`: per-frame hand-off to the application layer

mod connection;
mod event_loop;
mod frame;
mod listener;
mod sink;

pub use event_loop::EventLoop;
pub use frame::{CloseReason, FrameReader, Progress, ReadState};
pub use listener::Listener;
pub use sink::{FrameSink, LogSink};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use tracing::info;

/// Run the server with the default logging sink until the readiness wait
/// fails.
pub fn run(config: &Config) -> io::Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let listener = Listener::bind(addr)?;
    info!(addr = %listener.local_addr()?, "Listening");

    let mut event_loop = EventLoop::new(listener, LogSink, config.max_connections)?;
    event_loop.run()
}

//! Frame hand-off to the application layer.

use bytes::Bytes;
use tracing::info;

/// Receiver for assembled frames.
///
/// Called once per complete frame, on the event loop thread; an
/// implementation must not block for long or it stalls every connection.
/// The payload is opaque to the runtime.
pub trait FrameSink {
    /// Handle one frame from the connection identified by `conn_id`.
    fn on_frame(&mut self, conn_id: usize, payload: Bytes);
}

/// Default sink: logs each frame's origin and size.
pub struct LogSink;

impl FrameSink for LogSink {
    fn on_frame(&mut self, conn_id: usize, payload: Bytes) {
        info!(conn_id, len = payload.len(), "Frame received");
    }
}

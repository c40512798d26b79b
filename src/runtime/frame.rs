//! Length-prefixed frame reassembly.
//!
//! Each connection carries an ordered sequence of frames:
//! a 4-byte big-endian length followed by exactly that many payload bytes.
//! Length-prefixing lets the receiver size its buffer exactly and find frame
//! boundaries without delimiter scanning.
//!
//! The reader is driven by readiness events and never assumes a read
//! completes a frame: partial progress is kept across calls, and each read
//! asks for at most the current deficit so it cannot consume bytes belonging
//! to the next frame.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read};

/// Size of the length prefix on the wire.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Decoder state, observable for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Fewer than 4 prefix bytes accumulated.
    AwaitingLength,
    /// Prefix decoded; accumulating the declared number of payload bytes.
    AwaitingBody,
    /// Peer closed or a read failed; terminal.
    Closed,
}

/// Internal state. The prefix accumulates in a fixed array; the body
/// accumulates in `FrameReader::buf`, sized to the declared length.
#[derive(Debug, Clone, Copy)]
enum State {
    AwaitingLength { prefix: [u8; 4], filled: usize },
    AwaitingBody { expected: usize, filled: usize },
    Closed,
}

/// Why the reader transitioned to `Closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed between frames (clean disconnect).
    PeerClosed,
    /// Peer closed mid-frame; the partial frame is discarded.
    TruncatedFrame,
    /// The underlying read failed.
    Error(io::Error),
}

/// Outcome of a single `read_step` call.
#[derive(Debug)]
pub enum Progress {
    /// A complete frame was assembled on this step.
    Frame(Bytes),
    /// Bytes were consumed but the current frame is still incomplete.
    Pending,
    /// Readiness was stale; resume on the next notification.
    WouldBlock,
    /// The connection is done; no further frames will be produced.
    Closed(CloseReason),
}

/// Incremental length-prefixed frame decoder for one connection.
#[derive(Debug)]
pub struct FrameReader {
    state: State,
    buf: BytesMut,
}

impl FrameReader {
    /// Create a reader expecting a length prefix.
    pub fn new() -> Self {
        Self {
            state: State::AwaitingLength {
                prefix: [0; 4],
                filled: 0,
            },
            buf: BytesMut::new(),
        }
    }

    /// Current decoder state.
    pub fn state(&self) -> ReadState {
        match self.state {
            State::AwaitingLength { .. } => ReadState::AwaitingLength,
            State::AwaitingBody { .. } => ReadState::AwaitingBody,
            State::Closed => ReadState::Closed,
        }
    }

    /// Issue exactly one read against `src` and advance the decoder.
    ///
    /// The read asks for the current deficit only: `4 - filled` prefix
    /// bytes, or `expected - filled` body bytes. Call again while this
    /// returns [`Progress::Pending`] or [`Progress::Frame`]; stop on
    /// [`Progress::WouldBlock`] and resume after the next readiness event.
    pub fn read_step<R: Read>(&mut self, src: &mut R) -> Progress {
        match self.state {
            State::AwaitingLength { mut prefix, filled } => {
                let n = match src.read(&mut prefix[filled..]) {
                    Ok(0) => return self.close(CloseReason::PeerClosed),
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Progress::WouldBlock
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Progress::Pending
                    }
                    Err(e) => return self.close(CloseReason::Error(e)),
                };

                let filled = filled + n;
                if filled < LENGTH_PREFIX_SIZE {
                    self.state = State::AwaitingLength { prefix, filled };
                    return Progress::Pending;
                }

                let expected = u32::from_be_bytes(prefix) as usize;
                if expected == 0 {
                    // Zero-length frame: complete as soon as the prefix is.
                    self.state = State::AwaitingLength {
                        prefix: [0; 4],
                        filled: 0,
                    };
                    return Progress::Frame(Bytes::new());
                }

                self.buf.resize(expected, 0);
                self.state = State::AwaitingBody {
                    expected,
                    filled: 0,
                };
                Progress::Pending
            }
            State::AwaitingBody { expected, filled } => {
                let n = match src.read(&mut self.buf[filled..expected]) {
                    Ok(0) => return self.close(CloseReason::TruncatedFrame),
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Progress::WouldBlock
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        return Progress::Pending
                    }
                    Err(e) => return self.close(CloseReason::Error(e)),
                };

                let filled = filled + n;
                if filled < expected {
                    self.state = State::AwaitingBody { expected, filled };
                    return Progress::Pending;
                }

                let payload = self.buf.split_to(expected).freeze();
                self.state = State::AwaitingLength {
                    prefix: [0; 4],
                    filled: 0,
                };
                Progress::Frame(payload)
            }
            State::Closed => Progress::Closed(CloseReason::PeerClosed),
        }
    }

    fn close(&mut self, reason: CloseReason) -> Progress {
        self.state = State::Closed;
        self.buf.clear();
        Progress::Closed(reason)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

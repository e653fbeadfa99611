//! Framing contract.
//!
//! A framer turns raw bytes plus the leftover from previous calls into at
//! most one packet per call. The framing worker calls it repeatedly for
//! each chunk read from a connection:
//!
//! ```text
//! read(chunk, leftover)  -> Frame { ready: true,  finished: false, .. }  // packet 1, more buffered
//! read(&[], leftover)    -> Frame { ready: true,  finished: true,  .. }  // packet 2, nothing left
//! ```
//!
//! - `ready`: a packet (or a decode error) is available for the handler.
//! - `finished`: everything buffered has been consumed; the connection's
//!   stream is at a packet boundary and its worker may be unbound.
//! - neither: a partial packet is buffered in `leftover`; wait for more
//!   bytes on the same worker.

use std::fmt;

/// Result of one framing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<P> {
    /// Decoded packet, if any
    pub packet: Option<P>,
    /// Bytes carried into the next call
    pub leftover: Vec<u8>,
    /// Nothing buffered remains to be framed
    pub finished: bool,
    /// `packet` and/or `error` should be handed to the handler
    pub ready: bool,
    /// Decode failure, delivered to the handler as data
    pub error: Option<DecodeError>,
}

impl<P> Frame<P> {
    /// A decoded packet; finished when nothing is left over.
    pub fn packet(packet: P, leftover: Vec<u8>) -> Self {
        let finished = leftover.is_empty();
        Self {
            packet: Some(packet),
            leftover,
            finished,
            ready: true,
            error: None,
        }
    }

    /// No packet yet. With an empty leftover the stream is idle
    /// (finished); otherwise a partial packet is buffered.
    pub fn incomplete(leftover: Vec<u8>) -> Self {
        let finished = leftover.is_empty();
        Self {
            packet: None,
            leftover,
            finished,
            ready: false,
            error: None,
        }
    }

    /// A decode failure. The remaining bytes are kept so the framer can
    /// resynchronise on the next call.
    pub fn error(error: DecodeError, leftover: Vec<u8>) -> Self {
        let finished = leftover.is_empty();
        Self {
            packet: None,
            leftover,
            finished,
            ready: true,
            error: Some(error),
        }
    }
}

/// Framing failure passed through to the handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Declared or accumulated length exceeds the framer's limit
    TooLong { len: usize, max: usize },
    /// Malformed input
    Invalid(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooLong { len, max } => {
                write!(f, "frame of {} bytes exceeds limit {}", len, max)
            }
            DecodeError::Invalid(msg) => write!(f, "invalid frame: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

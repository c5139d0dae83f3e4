//! Protocol error taxonomy.
//!
//! Every variant except `MemFault` is fatal for the session: the peer is out
//! of sync and there is no mid-session resync, so callers tear the
//! connection down. Memory faults are reported in-band via the status byte
//! of a memory-buffer reply and never surface here.

use thiserror::Error;

use crate::msg::MsgId;

/// Errors produced by the framing layer and message codecs.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peeked header does not carry the id the caller expected.
    ///
    /// The header stays buffered; the caller may dispatch on `got` instead.
    #[error("unexpected message id: expected {expected:?}, got {got:?}")]
    UnexpectedId {
        /// Id the caller asked to consume.
        expected: MsgId,
        /// Id actually sitting in the peek slot.
        got: MsgId,
    },

    /// A payload length disagrees with the announced or required size.
    #[error("payload size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch {
        /// Size the header or struct layout requires.
        expected: usize,
        /// Size actually announced or supplied.
        got: usize,
    },

    /// A header was sent while the previous outbound payload is incomplete.
    #[error("header sent while {remaining} payload bytes are still pending")]
    HeaderPending {
        /// Payload bytes announced but not yet written.
        remaining: usize,
    },

    /// Structurally invalid frame content (bad struct bytes, bad ancillary
    /// data on fork handoff, negative size).
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// Underlying socket I/O failed or reached end-of-stream mid-frame.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error is a clean end-of-stream before any header byte,
    /// i.e. the peer closed the connection between frames.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

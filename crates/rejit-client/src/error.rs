//! Client error types.

use thiserror::Error;

/// Errors surfaced by the translator facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Framing or transport failure; the session is unusable afterwards.
    #[error("protocol error: {0}")]
    Protocol(#[from] rejit_proto::ProtocolError),

    /// The inherited-descriptor specification is not a plain decimal.
    #[error("invalid file descriptor specification {0:?}")]
    BadFdSpec(String),

    /// The server reported a nonzero error code in its fork reply.
    #[error("fork handoff failed on the server: error code {0}")]
    Fork(i32),

    /// The server reported this address untranslatable (empty object, no
    /// hash). Retrying through this channel is a contract violation.
    #[error("address {addr:#x} is untranslatable")]
    Untranslatable {
        /// Guest address of the failed request.
        addr: u64,
    },

    /// The server signalled a cache hit for a hash this client does not
    /// hold; the cache handle and the server disagree.
    #[error("no cached object for the hash the server assumed")]
    CacheMiss,

    /// Buffer management failed (receive-mapping allocation).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

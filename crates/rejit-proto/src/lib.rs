//! Wire protocol for the rejit translation service.
//!
//! A client embedded in the guest process and a translation server exchange
//! framed messages over one stream socket. Every frame is an 8-byte
//! [`MsgHdr`] (message id + payload size) followed by that many payload
//! bytes. Payloads are fixed-layout C structs parsed with `zerocopy`, except
//! the variable-length object image and memory-buffer replies.
//!
//! [`Channel`] implements the framing discipline on top of any blocking
//! `Read + Write` stream: complete reads and writes, and a one-slot header
//! peek so callers can dispatch on the next message id without consuming it.

mod arch;
mod channel;
mod errors;
mod msg;

pub use arch::{Arch, CallConv};
pub use channel::Channel;
pub use errors::ProtocolError;
pub use msg::{
    CacheProbe, ClientConfig, CodeHash, HASH_LEN, MEMBUF_MAX, MemRequest, MemStatus, MsgHdr,
    MsgId, ObjectInfo, ServerConfig,
};

/// Convenience alias for protocol results.
pub type Result<T> = std::result::Result<T, ProtocolError>;

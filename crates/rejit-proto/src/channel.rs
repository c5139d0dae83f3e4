//! Blocking framing channel with a one-slot header peek.
//!
//! All reads and writes are complete: `read_exact`/`write_all` retry partial
//! transfers until the full count moved or a hard error surfaced. The
//! channel tracks two pieces of framing state:
//!
//! - the inbound peek slot, holding at most one received-but-unconsumed
//!   header, so callers can branch on the next message id (the client's get
//!   loop distinguishes memory requests from the final object this way);
//! - the outbound pending count, the payload bytes announced by the last
//!   sent header that have not been written yet. Sending a new header while
//!   bytes are pending is a protocol error, which keeps frames on the wire
//!   exactly as announced.

use std::io::{Read, Write};

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::{
    Result,
    errors::ProtocolError,
    msg::{MsgHdr, MsgId},
};

/// Framed message channel over a blocking byte stream.
#[derive(Debug)]
pub struct Channel<S> {
    stream: S,
    /// Inbound header received but not yet consumed.
    peeked: Option<MsgHdr>,
    /// Outbound payload bytes announced but not yet written.
    send_pending: usize,
}

impl<S> Channel<S> {
    /// Wrap a stream. The peek slot starts empty.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self { stream, peeked: None, send_pending: 0 }
    }

    /// Shared access to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Exclusive access to the underlying stream.
    ///
    /// Used by the fork handoff, which reads ancillary data the framing
    /// layer cannot express. The caller must not disturb frame boundaries.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the stream, discarding framing state.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> Channel<S> {
    /// Send a header announcing `size` payload bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::HeaderPending`] if the previous frame's payload has
    /// not been fully written; [`ProtocolError::Malformed`] for a negative
    /// size.
    pub fn send_header(&mut self, id: MsgId, size: i32) -> Result<()> {
        if self.send_pending != 0 {
            return Err(ProtocolError::HeaderPending { remaining: self.send_pending });
        }
        if size < 0 {
            return Err(ProtocolError::Malformed("negative payload size"));
        }
        let hdr = MsgHdr::new(id, size);
        self.stream.write_all(hdr.as_bytes())?;
        self.send_pending = size as usize;
        Ok(())
    }

    /// Write payload bytes against the last sent header.
    ///
    /// May be called repeatedly (the memory-buffer reply writes its data and
    /// status byte separately); the total must not exceed the announced size.
    pub fn send_payload(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.send_pending {
            return Err(ProtocolError::SizeMismatch {
                expected: self.send_pending,
                got: bytes.len(),
            });
        }
        self.stream.write_all(bytes)?;
        self.send_pending -= bytes.len();
        Ok(())
    }

    /// Send a complete message: header plus payload.
    pub fn send_msg(&mut self, id: MsgId, payload: &[u8]) -> Result<()> {
        let size = i32::try_from(payload.len())
            .map_err(|_| ProtocolError::Malformed("payload exceeds frame size limit"))?;
        self.send_header(id, size)?;
        self.send_payload(payload)
    }

    /// Send a fixed-layout struct as a complete message.
    pub fn send_struct<T: IntoBytes + Immutable>(&mut self, id: MsgId, value: &T) -> Result<()> {
        self.send_msg(id, value.as_bytes())
    }
}

impl<S: Read> Channel<S> {
    /// Return the next inbound header without consuming it.
    ///
    /// Fills the peek slot from the stream when empty; repeated peeks return
    /// the same header until [`Channel::consume_header`] clears it.
    pub fn peek_header(&mut self) -> Result<MsgHdr> {
        if let Some(hdr) = self.peeked {
            return Ok(hdr);
        }
        let mut buf = [0u8; MsgHdr::SIZE];
        self.stream.read_exact(&mut buf)?;
        let hdr = MsgHdr::read_from_bytes(&buf)
            .map_err(|_| ProtocolError::Malformed("short header"))?;
        self.peeked = Some(hdr);
        Ok(hdr)
    }

    /// Consume the peeked header if it matches `expected`; return its size.
    ///
    /// On mismatch the header stays in the peek slot and
    /// [`ProtocolError::UnexpectedId`] is returned, so the caller can
    /// dispatch on the id it actually got.
    pub fn consume_header(&mut self, expected: MsgId) -> Result<i32> {
        let hdr = self.peek_header()?;
        if hdr.msg_id() != expected {
            return Err(ProtocolError::UnexpectedId { expected, got: hdr.msg_id() });
        }
        if hdr.size() < 0 {
            return Err(ProtocolError::Malformed("negative payload size"));
        }
        self.peeked = None;
        Ok(hdr.size())
    }

    /// Read exactly `buf.len()` payload bytes.
    pub fn recv_payload(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    /// Read a fixed-layout struct payload, checking `announced` against the
    /// struct size first.
    pub fn recv_struct<T: FromBytes>(&mut self, announced: i32) -> Result<T> {
        let want = std::mem::size_of::<T>();
        if announced < 0 || announced as usize != want {
            return Err(ProtocolError::SizeMismatch {
                expected: want,
                got: announced.max(0) as usize,
            });
        }
        let mut buf = vec![0u8; want];
        self.stream.read_exact(&mut buf)?;
        T::read_from_bytes(&buf).map_err(|_| ProtocolError::Malformed("truncated struct payload"))
    }

    /// Consume a header of `expected` id and read its struct payload.
    pub fn recv_msg_struct<T: FromBytes>(&mut self, expected: MsgId) -> Result<T> {
        let size = self.consume_header(expected)?;
        self.recv_struct(size)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::msg::MemRequest;

    /// Sender writes into a Vec, receiver reads the bytes back.
    fn pipe(producer: impl FnOnce(&mut Channel<Vec<u8>>)) -> Channel<Cursor<Vec<u8>>> {
        let mut tx = Channel::new(Vec::new());
        producer(&mut tx);
        Channel::new(Cursor::new(tx.into_inner()))
    }

    #[test]
    fn send_then_consume_round_trip() {
        let mut rx = pipe(|tx| {
            tx.send_msg(MsgId::CTranslate, &0x40_1000u64.to_ne_bytes()).unwrap();
        });

        let size = rx.consume_header(MsgId::CTranslate).unwrap();
        assert_eq!(size, 8);
        let mut addr = [0u8; 8];
        rx.recv_payload(&mut addr).unwrap();
        assert_eq!(u64::from_ne_bytes(addr), 0x40_1000);
    }

    #[test]
    fn peek_is_sticky_until_consumed() {
        let mut rx = pipe(|tx| {
            tx.send_struct(MsgId::SMemreq, &MemRequest { addr: 0x10, buf_sz: 64 }).unwrap();
        });

        let first = rx.peek_header().unwrap();
        let second = rx.peek_header().unwrap();
        assert_eq!(first, second);

        // Mismatched consume leaves the slot intact.
        let err = rx.consume_header(MsgId::SObject).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedId { expected: MsgId::SObject, got: MsgId::SMemreq }
        ));

        let req: MemRequest = rx.recv_msg_struct(MsgId::SMemreq).unwrap();
        assert_eq!(req.addr, 0x10);
        assert_eq!(req.buf_sz, 64);
    }

    #[test]
    fn header_while_payload_pending_is_rejected() {
        let mut tx = Channel::new(Vec::new());
        tx.send_header(MsgId::CMembuf, 4).unwrap();
        tx.send_payload(&[1, 2]).unwrap();

        let err = tx.send_header(MsgId::CFork, 0).unwrap_err();
        assert!(matches!(err, ProtocolError::HeaderPending { remaining: 2 }));

        // Completing the payload clears the guard.
        tx.send_payload(&[3, 4]).unwrap();
        tx.send_header(MsgId::CFork, 0).unwrap();
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut tx = Channel::new(Vec::new());
        tx.send_header(MsgId::CMembuf, 2).unwrap();
        let err = tx.send_payload(&[0; 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { expected: 2, got: 3 }));
    }

    #[test]
    fn struct_size_mismatch_is_rejected() {
        let mut rx = pipe(|tx| {
            tx.send_msg(MsgId::SMemreq, &[0u8; 4]).unwrap();
        });
        let size = rx.consume_header(MsgId::SMemreq).unwrap();
        let err = rx.recv_struct::<MemRequest>(size).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { expected: 16, got: 4 }));
    }

    #[test]
    fn eof_between_frames_reads_as_disconnect() {
        let mut rx = Channel::new(Cursor::new(Vec::new()));
        let err = rx.peek_header().unwrap_err();
        assert!(err.is_disconnect());
    }
}

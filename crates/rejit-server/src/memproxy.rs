//! Memory proxy: guest reads round-tripped through the client.
//!
//! The server never maps the guest; guest memory lives in the client and is
//! lazily faulted there. Each read sends a memory request and blocks on the
//! reply, whose length is always the clamped request size plus one status
//! byte. Requests larger than the clamp are split into page-sized
//! exchanges so subsequent frames stay aligned.

use std::io::{Read, Write};

use rejit_proto::{Channel, MEMBUF_MAX, MemRequest, MemStatus, MsgId, ProtocolError};

use crate::pipeline::GuestSource;

/// [`GuestSource`] implementation over the connection channel.
pub struct MemProxy<'a, S> {
    chan: &'a mut Channel<S>,
}

impl<'a, S: Read + Write> MemProxy<'a, S> {
    /// Borrow the channel for the duration of one decode or hash pass.
    pub fn new(chan: &'a mut Channel<S>) -> Self {
        Self { chan }
    }

    fn fetch_chunk(&mut self, addr: u64, buf: &mut [u8]) -> rejit_proto::Result<MemStatus> {
        let request = MemRequest { addr, buf_sz: buf.len() as u64 };
        self.chan.send_struct(MsgId::SMemreq, &request)?;

        let size = self.chan.consume_header(MsgId::CMembuf)?;
        let expected = request.clamped_len() + 1;
        if size as usize != expected {
            return Err(ProtocolError::SizeMismatch { expected, got: size as usize });
        }

        self.chan.recv_payload(buf)?;
        let mut status = [0u8; 1];
        self.chan.recv_payload(&mut status)?;
        Ok(MemStatus::from_byte(status[0]))
    }
}

impl<S: Read + Write> GuestSource for MemProxy<'_, S> {
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> rejit_proto::Result<MemStatus> {
        let mut status = MemStatus::Ok;
        let mut offset = 0usize;
        while offset < buf.len() {
            let len = (buf.len() - offset).min(MEMBUF_MAX as usize);
            let chunk = &mut buf[offset..offset + len];
            if self.fetch_chunk(addr + offset as u64, chunk)?.is_fault() {
                status = MemStatus::Fault;
            }
            offset += len;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, thread};

    use super::*;

    /// Serve scripted membuf replies from a background client.
    fn with_client<F, G>(client: F, server: G)
    where
        F: FnOnce(Channel<std::os::unix::net::UnixStream>) + Send + 'static,
        G: FnOnce(Channel<std::os::unix::net::UnixStream>),
    {
        let (a, b) = std::os::unix::net::UnixStream::pair().expect("socketpair");
        let handle = thread::spawn(move || client(Channel::new(a)));
        server(Channel::new(b));
        handle.join().expect("client thread");
    }

    #[test]
    fn read_round_trips_one_request() {
        with_client(
            |mut chan| {
                let req: MemRequest = chan.recv_msg_struct(MsgId::SMemreq).unwrap();
                assert_eq!(req.addr, 0x40_1000);
                assert_eq!(req.buf_sz, 4);
                chan.send_header(MsgId::CMembuf, 5).unwrap();
                chan.send_payload(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
                chan.send_payload(&[MemStatus::Ok.to_byte()]).unwrap();
            },
            |mut chan| {
                let mut proxy = MemProxy::new(&mut chan);
                let mut buf = [0u8; 4];
                let status = proxy.read(0x40_1000, &mut buf).unwrap();
                assert_eq!(status, MemStatus::Ok);
                assert_eq!(buf, [0xde, 0xad, 0xbe, 0xef]);
            },
        );
    }

    #[test]
    fn oversized_reads_split_at_the_clamp() {
        let total = MEMBUF_MAX as usize + 100;
        with_client(
            move |mut chan| {
                let first: MemRequest = chan.recv_msg_struct(MsgId::SMemreq).unwrap();
                assert_eq!(first.buf_sz, MEMBUF_MAX);
                chan.send_header(MsgId::CMembuf, MEMBUF_MAX as i32 + 1).unwrap();
                chan.send_payload(&vec![0xaa; MEMBUF_MAX as usize]).unwrap();
                chan.send_payload(&[MemStatus::Ok.to_byte()]).unwrap();

                let second: MemRequest = chan.recv_msg_struct(MsgId::SMemreq).unwrap();
                assert_eq!(second.addr, first.addr + MEMBUF_MAX);
                assert_eq!(second.buf_sz, 100);
                chan.send_header(MsgId::CMembuf, 101).unwrap();
                chan.send_payload(&[0xbb; 100]).unwrap();
                chan.send_payload(&[MemStatus::Fault.to_byte()]).unwrap();
            },
            move |mut chan| {
                let mut proxy = MemProxy::new(&mut chan);
                let mut buf = vec![0u8; total];
                let status = proxy.read(0x8000, &mut buf).unwrap();
                assert_eq!(status, MemStatus::Fault);
                assert!(buf[..MEMBUF_MAX as usize].iter().all(|&b| b == 0xaa));
                assert!(buf[MEMBUF_MAX as usize..].iter().all(|&b| b == 0xbb));
            },
        );
    }

    #[test]
    fn short_reply_is_a_protocol_error() {
        let mut wire = Channel::new(Vec::new());
        wire.send_header(MsgId::CMembuf, 3).unwrap();
        wire.send_payload(&[0, 0, 0]).unwrap();
        // Reply claims 3 bytes for a 4-byte request: framing is broken.
        let mut rx = Channel::new(ForwardingStream(Cursor::new(wire.into_inner())));
        let mut proxy = MemProxy::new(&mut rx);
        let mut buf = [0u8; 4];
        let err = proxy.read(0, &mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::SizeMismatch { expected: 5, got: 3 }));
    }

    /// Reads from the scripted bytes, discards writes.
    struct ForwardingStream(Cursor<Vec<u8>>);

    impl Read for ForwardingStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for ForwardingStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}

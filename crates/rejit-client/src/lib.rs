//! Guest-embedded translator client.
//!
//! The [`Translator`] lives inside the guest process and talks to the
//! translation server over one inherited socket. It owns guest memory
//! access, the translation cache, and the page-aligned buffer objects are
//! received into; the server drives it with memory requests and cache
//! probes strictly nested inside each translation.
//!
//! The client is single-threaded within one [`Translator::get`]: no other
//! translation may be interleaved on the same socket.

mod cache;
mod error;
mod memory;
mod recvbuf;

use std::{
    io::IoSliceMut,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use bytes::Bytes;
pub use cache::{MemoryCache, NoCache, ObjectCache};
pub use error::ClientError;
pub use memory::{GuestMemory, SelfMem};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
pub use recvbuf::RecvBuf;
use rejit_proto::{
    CacheProbe, Channel, ClientConfig, CodeHash, MemRequest, MsgId, ObjectInfo, ProtocolError,
    ServerConfig,
};
use zerocopy::FromBytes;

/// Convenience alias for client results.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Parse an ASCII-decimal inherited descriptor number.
///
/// The server address is nothing but this number, inherited from the
/// parent; no hostname, port, or path is involved.
fn parse_fd(spec: &str) -> Result<i32> {
    if spec.is_empty() {
        return Err(ClientError::BadFdSpec(spec.to_owned()));
    }
    let mut fd: i32 = 0;
    for ch in spec.chars() {
        let digit = ch.to_digit(10).ok_or_else(|| ClientError::BadFdSpec(spec.to_owned()))?;
        fd = fd
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit as i32))
            .ok_or_else(|| ClientError::BadFdSpec(spec.to_owned()))?;
    }
    Ok(fd)
}

/// Client-side mirror of the translation service.
pub struct Translator {
    chan: Channel<UnixStream>,
    recvbuf: RecvBuf,
    memory: Box<dyn GuestMemory>,
    cache: Box<dyn ObjectCache>,
    written_bytes: u64,
}

impl Translator {
    /// Attach to the inherited server socket named by `spec`.
    ///
    /// Production defaults: own-address-space memory reads and the
    /// in-memory cache.
    pub fn connect(spec: &str) -> Result<Self> {
        let fd = parse_fd(spec)?;
        // Ownership of the inherited descriptor transfers to us here.
        #[allow(unsafe_code)]
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_stream(
            UnixStream::from(owned),
            Box::new(SelfMem::new()),
            Box::new(MemoryCache::new()),
        ))
    }

    /// Build a translator over an already-connected stream.
    #[must_use]
    pub fn from_stream(
        stream: UnixStream,
        memory: Box<dyn GuestMemory>,
        cache: Box<dyn ObjectCache>,
    ) -> Self {
        Self {
            chan: Channel::new(stream),
            recvbuf: RecvBuf::new(),
            memory,
            cache,
            written_bytes: 0,
        }
    }

    /// Send the session configuration (C_INIT).
    pub fn init(&mut self, config: &ServerConfig) -> Result<()> {
        self.chan.send_struct(MsgId::CInit, config)?;
        Ok(())
    }

    /// Receive the negotiated client configuration (S_INIT).
    pub fn fetch_config(&mut self) -> Result<ClientConfig> {
        Ok(self.chan.recv_msg_struct(MsgId::SInit)?)
    }

    /// Receive the init-time bootstrap object carrying the helper skeleton.
    ///
    /// Emitted by the server with address 0 and no hash; it is an init-only
    /// payload and is never entered into the translation cache.
    pub fn bootstrap_object(&mut self) -> Result<&[u8]> {
        self.recv_object()?;
        Ok(self.recvbuf.object())
    }

    /// Total guest-memory bytes served to the server so far.
    #[must_use]
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    /// Request translation of the block at `addr`.
    ///
    /// Drives the memory-fetch and cache-probe loop until the server's
    /// S_OBJECT arrives; there is no bound on the number of requests the
    /// server may issue in between.
    pub fn get(&mut self, addr: u64) -> Result<&[u8]> {
        self.chan.send_msg(MsgId::CTranslate, &addr.to_ne_bytes())?;

        loop {
            let hdr = self.chan.peek_header()?;
            match hdr.msg_id() {
                MsgId::SMemreq => {
                    let req: MemRequest = self.chan.recv_msg_struct(MsgId::SMemreq)?;
                    self.serve_memreq(&req)?;
                },
                MsgId::SCacheProbe => {
                    let probe: CacheProbe = self.chan.recv_msg_struct(MsgId::SCacheProbe)?;
                    let hit = self.cache.probe(probe.addr, probe.hash);
                    self.chan.send_msg(MsgId::CCacheStatus, &[u8::from(hit)])?;
                },
                MsgId::SObject => break,
                got => {
                    return Err(ProtocolError::UnexpectedId { expected: MsgId::SObject, got }
                        .into());
                },
            }
        }

        let (len, hash) = self.recv_object()?;
        match (len, hash) {
            // Empty object without a hash: permanently untranslatable.
            (0, None) => Err(ClientError::Untranslatable { addr }),
            // Empty object with a hash: the probe promised we hold it.
            (0, Some(hash)) => {
                let object = self.cache.lookup(hash).ok_or(ClientError::CacheMiss)?;
                self.recvbuf.reserve(object.len())?;
                self.recvbuf.space(object.len()).copy_from_slice(&object);
                self.recvbuf.set_len(object.len());
                Ok(self.recvbuf.object())
            },
            (_, hash) => {
                if let Some(hash) = hash {
                    self.cache.insert(addr, hash, Bytes::copy_from_slice(self.recvbuf.object()));
                }
                Ok(self.recvbuf.object())
            },
        }
    }

    /// Service one memory request: clamped data bytes plus the status byte.
    fn serve_memreq(&mut self, req: &MemRequest) -> Result<()> {
        let len = req.clamped_len();
        let mut data = vec![0u8; len];
        let status = self.memory.read(req.addr, &mut data);
        if status.is_fault() {
            tracing::debug!("memory read faulted at {:#x} ({len} bytes)", req.addr);
        }

        self.chan.send_header(MsgId::CMembuf, (len + 1) as i32)?;
        self.chan.send_payload(&data)?;
        self.chan.send_payload(&[status.to_byte()])?;
        self.written_bytes += len as u64;
        Ok(())
    }

    /// Receive an S_OBJECT into the buffer; returns (length, hash).
    fn recv_object(&mut self) -> Result<(usize, Option<CodeHash>)> {
        let size = self.chan.consume_header(MsgId::SObject)? as usize;
        if size < ObjectInfo::SIZE {
            return Err(ProtocolError::Malformed("object payload shorter than its prefix").into());
        }

        let mut info_buf = [0u8; ObjectInfo::SIZE];
        self.chan.recv_payload(&mut info_buf)?;
        let info = ObjectInfo::read_from_bytes(&info_buf)
            .map_err(|_| ProtocolError::Malformed("bad object prefix"))?;

        let len = size - ObjectInfo::SIZE;
        self.recvbuf.reserve(len)?;
        self.chan.recv_payload(self.recvbuf.space(len))?;
        self.recvbuf.set_len(len);
        Ok((len, info.hash()))
    }

    /// Announce an imminent fork and collect the child's server connection.
    ///
    /// The reply carries a 4-byte error code and, on success, exactly one
    /// descriptor as `SCM_RIGHTS` ancillary data, received close-on-exec.
    pub fn fork_prepare(&mut self) -> Result<OwnedFd> {
        self.chan.send_header(MsgId::CFork, 0)?;

        let size = self.chan.consume_header(MsgId::SFd)?;
        if size != 4 {
            return Err(ProtocolError::SizeMismatch { expected: 4, got: size as usize }.into());
        }

        let mut error_buf = [0u8; 4];
        let mut cmsg_buf = nix::cmsg_space!([std::os::fd::RawFd; 1]);
        let mut rights = Vec::new();
        let bytes = {
            let mut iov = [IoSliceMut::new(&mut error_buf)];
            let msg = recvmsg::<()>(
                self.chan.get_ref().as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
            for cmsg in
                msg.cmsgs().map_err(|_| ProtocolError::Malformed("undersized ancillary buffer"))?
            {
                rights.push(cmsg);
            }
            msg.bytes
        };
        if bytes != 4 {
            return Err(ProtocolError::Malformed("short fd reply").into());
        }

        let error = i32::from_ne_bytes(error_buf);
        if error != 0 {
            return Err(ClientError::Fork(error));
        }

        match rights.as_slice() {
            [ControlMessageOwned::ScmRights(fds)] if fds.len() == 1 => {
                // The descriptor arrived via SCM_RIGHTS; we are its owner.
                #[allow(unsafe_code)]
                let fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
                Ok(fd)
            },
            _ => Err(ProtocolError::Malformed("fd reply without exactly one descriptor").into()),
        }
    }

    /// Retarget the translator at the forked child's connection.
    ///
    /// The previous socket belongs to the parent's session and is closed;
    /// subsequent translations use the new channel.
    pub fn fork_finalize(&mut self, fd: OwnedFd) {
        self.chan = Channel::new(UnixStream::from(fd));
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, thread};

    use rejit_proto::{MEMBUF_MAX, MemStatus};

    use super::*;

    /// Map-backed guest memory; unmapped bytes fault.
    struct SparseMem(HashMap<u64, u8>);

    impl GuestMemory for SparseMem {
        fn read(&self, addr: u64, buf: &mut [u8]) -> MemStatus {
            let mut status = MemStatus::Ok;
            for (i, slot) in buf.iter_mut().enumerate() {
                match self.0.get(&(addr + i as u64)) {
                    Some(&b) => *slot = b,
                    None => {
                        status = MemStatus::Fault;
                        *slot = 0;
                    },
                }
            }
            if status.is_fault() {
                buf.iter_mut().for_each(|b| *b = 0);
            }
            status
        }
    }

    fn translator_pair(memory: SparseMem) -> (Translator, Channel<UnixStream>) {
        let (client_end, server_end) = UnixStream::pair().expect("socketpair");
        let translator = Translator::from_stream(
            client_end,
            Box::new(memory),
            Box::new(MemoryCache::new()),
        );
        (translator, Channel::new(server_end))
    }

    #[test]
    fn parse_fd_accepts_plain_decimals() {
        assert_eq!(parse_fd("0").unwrap(), 0);
        assert_eq!(parse_fd("37").unwrap(), 37);
        assert!(matches!(parse_fd(""), Err(ClientError::BadFdSpec(_))));
        assert!(matches!(parse_fd("3x"), Err(ClientError::BadFdSpec(_))));
        assert!(matches!(parse_fd("99999999999"), Err(ClientError::BadFdSpec(_))));
    }

    #[test]
    fn memreq_is_clamped_and_padded() {
        let mem: HashMap<u64, u8> = (0..16u64).map(|i| (0x7ff0 + i, 0x11)).collect();
        let (mut translator, mut server) = translator_pair(SparseMem(mem));

        let handle = thread::spawn(move || {
            server.consume_header(MsgId::CTranslate).unwrap();
            let mut addr = [0u8; 8];
            server.recv_payload(&mut addr).unwrap();

            // Oversized request: the client must clamp to one page.
            server
                .send_struct(MsgId::SMemreq, &MemRequest { addr: 0x7ff0, buf_sz: 0x2000 })
                .unwrap();
            let size = server.consume_header(MsgId::CMembuf).unwrap();
            assert_eq!(size as u64, MEMBUF_MAX + 1);
            let mut reply = vec![0u8; size as usize];
            server.recv_payload(&mut reply).unwrap();
            // Faulted read: zero-filled data, trailing status byte 1.
            assert!(reply[..MEMBUF_MAX as usize].iter().all(|&b| b == 0));
            assert_eq!(reply[MEMBUF_MAX as usize], MemStatus::Fault.to_byte());

            // The frame boundary survived; emit the final object.
            server.send_header(MsgId::SObject, ObjectInfo::SIZE as i32 + 2).unwrap();
            use zerocopy::IntoBytes as _;
            server.send_payload(ObjectInfo::new(None).as_bytes()).unwrap();
            server.send_payload(b"ok").unwrap();
        });

        let object = translator.get(0x7ff0).unwrap().to_vec();
        assert_eq!(object, b"ok");
        assert_eq!(translator.written_bytes(), MEMBUF_MAX);
        handle.join().unwrap();
    }

    #[test]
    fn empty_object_without_hash_is_untranslatable() {
        let (mut translator, mut server) = translator_pair(SparseMem(HashMap::new()));

        let handle = thread::spawn(move || {
            use zerocopy::IntoBytes as _;
            server.consume_header(MsgId::CTranslate).unwrap();
            let mut addr = [0u8; 8];
            server.recv_payload(&mut addr).unwrap();
            server.send_header(MsgId::SObject, ObjectInfo::SIZE as i32).unwrap();
            server.send_payload(ObjectInfo::new(None).as_bytes()).unwrap();
        });

        let err = translator.get(0).unwrap_err();
        assert!(matches!(err, ClientError::Untranslatable { addr: 0 }));
        handle.join().unwrap();
    }

    #[test]
    fn hashed_objects_are_cached_and_replayed() {
        let (mut translator, mut server) = translator_pair(SparseMem(HashMap::new()));
        let hash = [0x5au8; 20];

        let handle = thread::spawn(move || {
            use zerocopy::IntoBytes as _;

            // First request: full object with hash.
            server.consume_header(MsgId::CTranslate).unwrap();
            let mut addr = [0u8; 8];
            server.recv_payload(&mut addr).unwrap();
            server.send_struct(MsgId::SCacheProbe, &CacheProbe::new(0x1000, hash)).unwrap();
            let size = server.consume_header(MsgId::CCacheStatus).unwrap();
            let mut status = vec![0u8; size as usize];
            server.recv_payload(&mut status).unwrap();
            assert_eq!(status, [0], "first probe must miss");
            server.send_header(MsgId::SObject, ObjectInfo::SIZE as i32 + 4).unwrap();
            server.send_payload(ObjectInfo::new(Some(hash)).as_bytes()).unwrap();
            server.send_payload(b"obj1").unwrap();

            // Second request: probe hits, empty object with the same hash.
            server.consume_header(MsgId::CTranslate).unwrap();
            server.recv_payload(&mut addr).unwrap();
            server.send_struct(MsgId::SCacheProbe, &CacheProbe::new(0x1000, hash)).unwrap();
            let size = server.consume_header(MsgId::CCacheStatus).unwrap();
            let mut status = vec![0u8; size as usize];
            server.recv_payload(&mut status).unwrap();
            assert_eq!(status, [1], "second probe must hit");
            server.send_header(MsgId::SObject, ObjectInfo::SIZE as i32).unwrap();
            server.send_payload(ObjectInfo::new(Some(hash)).as_bytes()).unwrap();
        });

        let first = translator.get(0x1000).unwrap().to_vec();
        assert_eq!(first, b"obj1");
        let second = translator.get(0x1000).unwrap().to_vec();
        assert_eq!(second, b"obj1");
        handle.join().unwrap();
    }
}

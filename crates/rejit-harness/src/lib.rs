//! Deterministic in-process harness.
//!
//! Runs a real server session on one end of a socketpair (reference
//! pipeline, real message loop) and a real [`Translator`] on the other,
//! inside one test process. Guest memory is a sparse region map, so every
//! fault boundary in the scenarios is exact and reproducible.

use std::{
    collections::BTreeMap,
    os::unix::net::UnixStream,
    thread::{self, JoinHandle},
};

use rejit_client::{GuestMemory, MemoryCache, Translator};
use rejit_proto::{Arch, ClientConfig, MemStatus, ProtocolError, ServerConfig};
use rejit_server::{ServerError, ServerOptions, pipeline::basic::basic_pipeline, serve};

/// Sparse guest memory made of disjoint byte regions.
///
/// Reads touching any byte outside every region fault, with the buffer
/// zero-filled past the readable prefix.
#[derive(Debug, Default, Clone)]
pub struct SparseMemory {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl SparseMemory {
    /// Empty memory; everything faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region at `addr`. Regions must not overlap.
    #[must_use]
    pub fn with_region(mut self, addr: u64, bytes: Vec<u8>) -> Self {
        self.regions.insert(addr, bytes);
        self
    }

    fn byte_at(&self, addr: u64) -> Option<u8> {
        let (&base, bytes) = self.regions.range(..=addr).next_back()?;
        bytes.get((addr - base) as usize).copied()
    }
}

impl GuestMemory for SparseMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemStatus {
        let mut readable = 0;
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.byte_at(addr + i as u64) {
                Some(byte) => {
                    *slot = byte;
                    readable = i + 1;
                },
                None => break,
            }
        }
        if readable == buf.len() {
            MemStatus::Ok
        } else {
            buf[readable..].fill(0);
            MemStatus::Fault
        }
    }
}

/// One live client/server session inside the test process.
pub struct SessionHarness {
    /// The guest-side translator under test.
    pub translator: Translator,
    server: JoinHandle<Result<(), ServerError>>,
}

impl SessionHarness {
    /// Spin up a server thread over a socketpair and attach a translator.
    pub fn start(options: ServerOptions, memory: SparseMemory) -> std::io::Result<Self> {
        let (client_end, server_end) = UnixStream::pair()?;
        let server = thread::spawn(move || {
            let mut pipeline = basic_pipeline();
            serve(server_end, &mut pipeline, options)
        });
        let translator = Translator::from_stream(
            client_end,
            Box::new(memory),
            Box::new(MemoryCache::new()),
        );
        Ok(Self { translator, server })
    }

    /// Run the init exchange and collect the bootstrap object.
    pub fn handshake(
        &mut self,
        guest: Arch,
        host: Arch,
        stack_alignment: u32,
    ) -> Result<(ClientConfig, Vec<u8>), rejit_client::ClientError> {
        self.translator.init(&ServerConfig {
            guest_arch: guest.to_elf(),
            host_arch: host.to_elf(),
            stack_alignment,
        })?;
        let config = self.translator.fetch_config()?;
        let bootstrap = self.translator.bootstrap_object()?.to_vec();
        Ok((config, bootstrap))
    }

    /// Close the client side and collect the server's exit status.
    pub fn shutdown(self) -> Result<(), ServerError> {
        drop(self.translator);
        match self.server.join() {
            Ok(result) => result,
            Err(_) => {
                Err(ServerError::Protocol(ProtocolError::Malformed("server thread panicked")))
            },
        }
    }
}

//! Guest memory sources.
//!
//! The client owns guest virtual memory; the server only ever sees it
//! through memory-request round trips. [`GuestMemory`] is the read seam:
//! the production implementation reads the client's own address space, test
//! code substitutes sparse maps.

use std::io::IoSliceMut;

use nix::sys::uio::{RemoteIoVec, process_vm_readv};
use rejit_proto::MemStatus;

/// Readable view of guest memory.
pub trait GuestMemory {
    /// Fill `buf` from guest address `addr`.
    ///
    /// On [`MemStatus::Fault`] every byte past the readable prefix must be
    /// zero, so the buffer can go on the wire as-is.
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemStatus;
}

/// Guest memory of the embedding process itself.
///
/// Reads go through `process_vm_readv` against our own pid rather than a
/// plain memory copy: an unmapped or lazily-faulted guest page surfaces as
/// a short read or `EFAULT` instead of crashing the client, which is
/// exactly the fault semantics the protocol wants.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfMem;

impl SelfMem {
    /// Reader over the current process's address space.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl GuestMemory for SelfMem {
    fn read(&self, addr: u64, buf: &mut [u8]) -> MemStatus {
        let pid = nix::unistd::Pid::this();
        let mut done = 0usize;
        while done < buf.len() {
            let remote = [RemoteIoVec { base: addr as usize + done, len: buf.len() - done }];
            let mut local = [IoSliceMut::new(&mut buf[done..])];
            match process_vm_readv(pid, &mut local, &remote) {
                Ok(0) | Err(_) => {
                    buf[done..].fill(0);
                    return MemStatus::Fault;
                },
                Ok(n) => done += n,
            }
        }
        MemStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_memory() {
        let data = [0xde_u8, 0xad, 0xbe, 0xef];
        let mut buf = [0u8; 4];
        let status = SelfMem::new().read(data.as_ptr() as u64, &mut buf);
        assert_eq!(status, MemStatus::Ok);
        assert_eq!(buf, data);
    }

    #[test]
    fn unmapped_address_faults_with_zeroed_buffer() {
        // Page 0 is never mapped in a hosted process.
        let mut buf = [0xff_u8; 16];
        let status = SelfMem::new().read(0, &mut buf);
        assert_eq!(status, MemStatus::Fault);
        assert!(buf.iter().all(|&b| b == 0));
    }
}

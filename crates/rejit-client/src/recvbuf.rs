//! Page-aligned receive buffer for object images.
//!
//! Translated objects are mapped and patched in place by the client
//! runtime, so the buffer is an anonymous page-aligned mapping rather than
//! a heap allocation. Growth doubles the capacity (rounded up to the page
//! size); the previous mapping is freed on growth.

use memmap2::MmapMut;
use nix::unistd::{SysconfVar, sysconf};

/// Growable page-aligned buffer holding the most recent object image.
#[derive(Debug, Default)]
pub struct RecvBuf {
    map: Option<MmapMut>,
    len: usize,
}

impl RecvBuf {
    /// Empty buffer; the first object allocates the mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn page_size() -> usize {
        sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(4096)
    }

    /// Current capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    /// Length of the object currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no object has been received yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow so that `size` bytes fit, replacing (and freeing) the old
    /// mapping when it is too small. Contents are not preserved; each
    /// object fully overwrites the buffer.
    pub fn reserve(&mut self, size: usize) -> std::io::Result<()> {
        if size <= self.capacity() && self.map.is_some() {
            return Ok(());
        }
        let page = Self::page_size();
        let rounded = size.div_ceil(page).max(1) * page;
        let target = rounded.max(self.capacity() * 2);
        self.map = Some(MmapMut::map_anon(target)?);
        Ok(())
    }

    /// Record the length of the object just written.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }

    /// The held object.
    #[must_use]
    pub fn object(&self) -> &[u8] {
        self.map.as_ref().map_or(&[], |m| &m[..self.len])
    }

    /// Writable space for receiving an object of `len` bytes.
    ///
    /// Callers must `reserve` first.
    pub fn space(&mut self, len: usize) -> &mut [u8] {
        debug_assert!(len <= self.capacity());
        self.map.as_mut().map_or(&mut [], |m| &mut m[..len])
    }
}

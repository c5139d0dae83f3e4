//! Content-hash builder.
//!
//! Accumulates the canonical byte image `config ∥ address ∥ decoded ranges`
//! and digests it with SHA-1. The config prefix is appended once per
//! session; after every request the buffer is truncated back to the prefix,
//! which is the sole mutation policy that keeps the prefix byte-identical
//! across requests.

use digest::Digest;
use rejit_proto::CodeHash;
use zerocopy::{Immutable, IntoBytes};

/// Fixed leading record of the hash-config prefix.
///
/// Followed by the lifter's and the backend's own config bytes. Bump
/// `version` whenever the layout or the meaning of any field changes, so
/// stale cache entries can never match.
#[derive(Debug, Clone, Copy, IntoBytes, Immutable)]
#[repr(C)]
pub struct HashConfig {
    /// Layout version, currently 2.
    pub version: u32,
    /// Call/ret instructions preserve guest flags.
    pub safe_call_ret: u8,
    /// Call-ret lifting enabled.
    pub enable_callret: u8,
    /// Fast calling convention enabled.
    pub enable_fastcc: u8,
    /// Position-independent output.
    pub enable_pic: u8,
    /// Guest ELF machine number.
    pub guest_arch: u32,
    /// Host ELF machine number.
    pub host_arch: u32,
    /// Stack alignment override.
    pub stack_alignment: u32,
}

/// Current hash-config layout version.
pub const HASH_CONFIG_VERSION: u32 = 2;

/// Accumulator for the per-request content hash.
#[derive(Debug, Default)]
pub struct HashBuilder {
    buf: Vec<u8>,
    prefix_len: usize,
}

impl HashBuilder {
    /// Empty builder; the prefix is sealed later, at session init.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the image.
    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Mark everything appended so far as the immutable config prefix.
    pub fn seal_prefix(&mut self) {
        self.prefix_len = self.buf.len();
    }

    /// The sealed config prefix.
    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.buf[..self.prefix_len]
    }

    /// Current image length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// SHA-1 over the whole accumulated image.
    #[must_use]
    pub fn digest(&self) -> CodeHash {
        let mut hasher = sha1::Sha1::new();
        hasher.update(&self.buf);
        hasher.finalize().into()
    }

    /// Truncate back to the config prefix, discarding the request part.
    pub fn reset(&mut self) {
        self.buf.truncate(self.prefix_len);
    }
}

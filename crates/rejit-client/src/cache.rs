//! Translation cache.
//!
//! The cache is an opaque handle the client manages; the server only ever
//! probes it by `(address, hash)` before deciding whether to skip codegen.
//! A probe answered with "hit" is a promise: the next empty S_OBJECT
//! carrying that hash will be satisfied from this cache.

use std::collections::HashMap;

use bytes::Bytes;
use rejit_proto::CodeHash;

/// Client-side object cache keyed by content hash.
pub trait ObjectCache {
    /// Would an object for `(addr, hash)` be available without codegen?
    fn probe(&mut self, addr: u64, hash: CodeHash) -> bool;

    /// Index a freshly received object under its hash.
    fn insert(&mut self, addr: u64, hash: CodeHash, object: Bytes);

    /// Fetch the object for `hash`, if held.
    fn lookup(&self, hash: CodeHash) -> Option<Bytes>;
}

/// In-memory cache; hash-keyed, address-oblivious.
///
/// The hash already binds everything that affects code generation, so the
/// address parameter is only useful for eviction policies this
/// implementation does not have.
#[derive(Debug, Default)]
pub struct MemoryCache {
    objects: HashMap<CodeHash, Bytes>,
}

impl MemoryCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectCache for MemoryCache {
    fn probe(&mut self, _addr: u64, hash: CodeHash) -> bool {
        self.objects.contains_key(&hash)
    }

    fn insert(&mut self, _addr: u64, hash: CodeHash, object: Bytes) {
        self.objects.insert(hash, object);
    }

    fn lookup(&self, hash: CodeHash) -> Option<Bytes> {
        self.objects.get(&hash).cloned()
    }
}

/// Cache that never hits; every translation runs the full pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ObjectCache for NoCache {
    fn probe(&mut self, _addr: u64, _hash: CodeHash) -> bool {
        false
    }

    fn insert(&mut self, _addr: u64, _hash: CodeHash, _object: Bytes) {}

    fn lookup(&self, _hash: CodeHash) -> Option<Bytes> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reflects_inserts() {
        let mut cache = MemoryCache::new();
        let hash = [7u8; 20];
        assert!(!cache.probe(0x1000, hash));

        cache.insert(0x1000, hash, Bytes::from_static(b"object"));
        assert!(cache.probe(0x1000, hash));
        // Hash-keyed: a different address with the same hash still hits.
        assert!(cache.probe(0x2000, hash));
        assert_eq!(cache.lookup(hash), Some(Bytes::from_static(b"object")));
    }

    #[test]
    fn no_cache_never_hits() {
        let mut cache = NoCache;
        cache.insert(0, [1; 20], Bytes::from_static(b"x"));
        assert!(!cache.probe(0, [1; 20]));
        assert_eq!(cache.lookup([1; 20]), None);
    }
}

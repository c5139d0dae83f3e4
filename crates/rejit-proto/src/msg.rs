//! Message ids, the frame header, and the fixed payload structs.
//!
//! All multi-byte integers are host-native and naturally aligned: the
//! protocol runs between two processes on the same machine over a
//! Unix-domain or loopback socket, so both ends always agree on byte order.
//! Struct layouts are `#[repr(C)]` without padding so they can be cast
//! to and from wire bytes with `zerocopy`.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Length of the content hash (SHA-1) in bytes.
pub const HASH_LEN: usize = 20;

/// Upper bound the client enforces on a single memory-request transfer.
///
/// Requests for more are clamped, which bounds the worst-case frame size;
/// the server learns the effective size from its own request because the
/// reply length is always `min(buf_sz, MEMBUF_MAX) + 1`.
pub const MEMBUF_MAX: u64 = 4096;

/// 20-byte content hash binding config, address, and decoded bytes.
pub type CodeHash = [u8; HASH_LEN];

/// Closed enumeration of message ids.
///
/// Client→server ids and server→client ids are disjoint ranges; `Unknown`
/// is the reserved empty sentinel that also marks an empty peek slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgId {
    /// Reserved sentinel; never valid on the wire.
    Unknown = 0,

    /// C→S: server configuration ([`ServerConfig`]).
    CInit = 0x11,
    /// C→S: translate the 8-byte guest address in the payload.
    CTranslate = 0x12,
    /// C→S: memory-request reply, `buf_sz` data bytes + 1 status byte.
    CMembuf = 0x13,
    /// C→S: cache-probe reply, 1 byte (1 = hit).
    CCacheStatus = 0x14,
    /// C→S: client is about to fork; empty payload.
    CFork = 0x15,

    /// S→C: negotiated client configuration ([`ClientConfig`]).
    SInit = 0x91,
    /// S→C: read guest memory ([`MemRequest`]).
    SMemreq = 0x92,
    /// S→C: object image, [`ObjectInfo`] prefix + bytes.
    SObject = 0x93,
    /// S→C: probe the translation cache ([`CacheProbe`]).
    SCacheProbe = 0x94,
    /// S→C: fork reply, 4-byte error code + one fd as ancillary data.
    SFd = 0x95,
}

impl MsgId {
    /// Decode a wire id. Unrecognized values map to [`MsgId::Unknown`].
    #[must_use]
    pub fn from_u32(id: u32) -> Self {
        match id {
            0x11 => Self::CInit,
            0x12 => Self::CTranslate,
            0x13 => Self::CMembuf,
            0x14 => Self::CCacheStatus,
            0x15 => Self::CFork,
            0x91 => Self::SInit,
            0x92 => Self::SMemreq,
            0x93 => Self::SObject,
            0x94 => Self::SCacheProbe,
            0x95 => Self::SFd,
            _ => Self::Unknown,
        }
    }

    /// Wire value of this id.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Outcome of a guest memory read.
///
/// Travels as the trailing status byte of every memory-buffer reply: the
/// payload is always `buf_sz` data bytes (zero-filled on fault) plus this
/// byte, so the reply length stays predictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemStatus {
    /// All requested bytes were readable.
    Ok = 0,
    /// Some byte was unreadable; the data bytes are zero-filled.
    Fault = 1,
}

impl MemStatus {
    /// Wire status byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Decode a wire status byte; any nonzero value reads as a fault.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        if byte == 0 { Self::Ok } else { Self::Fault }
    }

    /// True for [`MemStatus::Fault`].
    #[must_use]
    pub fn is_fault(self) -> bool {
        matches!(self, Self::Fault)
    }
}

/// Fixed 8-byte frame header: message id and signed payload size.
///
/// Exactly one header may sit "peeked but not consumed" per direction; the
/// [`Channel`](crate::Channel) owns that slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MsgHdr {
    id: u32,
    size: i32,
}

impl MsgHdr {
    /// Size of the serialized header.
    pub const SIZE: usize = 8;

    /// Build a header for `id` announcing `size` payload bytes.
    #[must_use]
    pub fn new(id: MsgId, size: i32) -> Self {
        Self { id: id.to_u32(), size }
    }

    /// Message id, with unrecognized values mapped to `Unknown`.
    #[must_use]
    pub fn msg_id(&self) -> MsgId {
        MsgId::from_u32(self.id)
    }

    /// Announced payload size in bytes.
    #[must_use]
    pub fn size(&self) -> i32 {
        self.size
    }
}

/// C_INIT payload: what the client wants translated, fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ServerConfig {
    /// Guest ELF machine number.
    pub guest_arch: u32,
    /// Host ELF machine number.
    pub host_arch: u32,
    /// Stack alignment the emitted code must maintain; 0 = backend default.
    pub stack_alignment: u32,
}

impl ServerConfig {
    /// Serialized size.
    pub const SIZE: usize = 12;
}

/// S_INIT payload: what the server decided, fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ClientConfig {
    /// Negotiated calling-convention code ([`CallConv`](crate::CallConv)).
    pub callconv: u32,
    /// Nonzero when the server accumulates per-stage timing.
    pub profile: u8,
    /// Perf-integration mode: 0 off, 1 memory map, 2 jitdump.
    pub perf: u8,
    /// Nonzero when the client should trace dispatches.
    pub trace: u8,
    /// Reserved; keeps the struct free of implicit padding.
    pub reserved: u8,
}

impl ClientConfig {
    /// Serialized size.
    pub const SIZE: usize = 8;
}

/// S_MEMREQ payload: read up to `buf_sz` bytes of guest memory at `addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MemRequest {
    /// Guest virtual address of the first byte.
    pub addr: u64,
    /// Requested byte count; the client clamps to [`MEMBUF_MAX`].
    pub buf_sz: u64,
}

impl MemRequest {
    /// Serialized size.
    pub const SIZE: usize = 16;

    /// Byte count the client will actually transfer.
    #[must_use]
    pub fn clamped_len(&self) -> usize {
        self.buf_sz.min(MEMBUF_MAX) as usize
    }
}

/// S_CACHEPROBE payload: may the server skip codegen for this request?
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CacheProbe {
    /// Guest address of the pending translation.
    pub addr: u64,
    /// Content hash of the pending translation.
    pub hash: CodeHash,
    /// Reserved; keeps the struct free of implicit padding.
    pub reserved: [u8; 4],
}

impl CacheProbe {
    /// Serialized size.
    pub const SIZE: usize = 32;

    /// Build a probe for `(addr, hash)`.
    #[must_use]
    pub fn new(addr: u64, hash: CodeHash) -> Self {
        Self { addr, hash, reserved: [0; 4] }
    }
}

/// Prefix of every S_OBJECT payload, ahead of the object image bytes.
///
/// A payload of exactly [`ObjectInfo::SIZE`] bytes is an "empty object":
/// with a hash it tells the client to reuse its cached image, without one it
/// marks the address permanently untranslatable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ObjectInfo {
    /// 1 when `hash` is meaningful.
    pub hash_present: u8,
    /// Content hash of the object, zeroed when absent.
    pub hash: CodeHash,
}

impl ObjectInfo {
    /// Serialized size.
    pub const SIZE: usize = 21;

    /// Prefix carrying `hash`, or the null prefix when `hash` is `None`.
    #[must_use]
    pub fn new(hash: Option<CodeHash>) -> Self {
        match hash {
            Some(hash) => Self { hash_present: 1, hash },
            None => Self { hash_present: 0, hash: [0; HASH_LEN] },
        }
    }

    /// The hash, when present.
    #[must_use]
    pub fn hash(&self) -> Option<CodeHash> {
        (self.hash_present != 0).then_some(self.hash)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use zerocopy::{FromBytes as _, IntoBytes as _};

    use super::*;

    #[test]
    fn struct_sizes_match_wire_contract() {
        assert_eq!(std::mem::size_of::<MsgHdr>(), MsgHdr::SIZE);
        assert_eq!(std::mem::size_of::<ServerConfig>(), ServerConfig::SIZE);
        assert_eq!(std::mem::size_of::<ClientConfig>(), ClientConfig::SIZE);
        assert_eq!(std::mem::size_of::<MemRequest>(), MemRequest::SIZE);
        assert_eq!(std::mem::size_of::<CacheProbe>(), CacheProbe::SIZE);
        assert_eq!(std::mem::size_of::<ObjectInfo>(), ObjectInfo::SIZE);
    }

    #[test]
    fn unknown_ids_map_to_sentinel() {
        assert_eq!(MsgId::from_u32(0), MsgId::Unknown);
        assert_eq!(MsgId::from_u32(0x42), MsgId::Unknown);
        assert_eq!(MsgId::from_u32(0xffff_ffff), MsgId::Unknown);
    }

    #[test]
    fn memreq_clamps_to_page() {
        let req = MemRequest { addr: 0x1000, buf_sz: 0x10_0000 };
        assert_eq!(req.clamped_len(), MEMBUF_MAX as usize);
        let req = MemRequest { addr: 0x1000, buf_sz: 17 };
        assert_eq!(req.clamped_len(), 17);
    }

    #[test]
    fn object_info_null_hash() {
        let info = ObjectInfo::new(None);
        assert_eq!(info.hash(), None);
        let info = ObjectInfo::new(Some([0xab; HASH_LEN]));
        assert_eq!(info.hash(), Some([0xab; HASH_LEN]));
    }

    proptest! {
        #[test]
        fn header_round_trip(id in any::<u32>(), size in any::<i32>()) {
            let hdr = MsgHdr { id, size };
            let parsed = MsgHdr::read_from_bytes(hdr.as_bytes()).unwrap();
            prop_assert_eq!(hdr, parsed);
        }

        #[test]
        fn memreq_round_trip(addr in any::<u64>(), buf_sz in any::<u64>()) {
            let req = MemRequest { addr, buf_sz };
            let parsed = MemRequest::read_from_bytes(req.as_bytes()).unwrap();
            prop_assert_eq!(req, parsed);
        }

        #[test]
        fn cache_probe_round_trip(addr in any::<u64>(), hash in any::<[u8; HASH_LEN]>()) {
            let probe = CacheProbe::new(addr, hash);
            let parsed = CacheProbe::read_from_bytes(probe.as_bytes()).unwrap();
            prop_assert_eq!(probe, parsed);
        }
    }
}

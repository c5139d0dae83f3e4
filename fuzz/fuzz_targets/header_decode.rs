//! Fuzz target for wire-struct decoding.
//!
//! Arbitrary bytes must never panic the zerocopy parsers; short or
//! misaligned input returns an error, everything else decodes into a
//! struct whose re-encoding round-trips.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rejit_proto::{CacheProbe, MemRequest, MsgHdr, ObjectInfo};
use zerocopy::{FromBytes, IntoBytes};

fuzz_target!(|data: &[u8]| {
    if let Ok(hdr) = MsgHdr::read_from_bytes(data) {
        assert_eq!(hdr.as_bytes(), data);
        let _ = hdr.msg_id();
    }
    let _ = MemRequest::read_from_bytes(data);
    let _ = CacheProbe::read_from_bytes(data);
    let _ = ObjectInfo::read_from_bytes(data);
});

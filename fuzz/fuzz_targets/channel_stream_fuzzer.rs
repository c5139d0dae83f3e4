//! Fuzz target for the framing channel's receive path.
//!
//! An arbitrary inbound byte stream is driven through peek/consume/recv in
//! an arbitrary order. The channel must never panic; truncated streams and
//! mismatched ids surface as errors only.

#![no_main]

use std::io::Cursor;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use rejit_proto::{Channel, MemRequest, MsgId};

#[derive(Debug, Arbitrary)]
enum Op {
    Peek,
    Consume(u32),
    RecvBytes(u8),
    RecvMemRequest,
}

#[derive(Debug, Arbitrary)]
struct Input {
    stream: Vec<u8>,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let mut chan = Channel::new(Cursor::new(input.stream));
    for op in input.ops {
        match op {
            Op::Peek => {
                let _ = chan.peek_header();
            },
            Op::Consume(id) => {
                let _ = chan.consume_header(MsgId::from_u32(id));
            },
            Op::RecvBytes(n) => {
                let mut buf = vec![0u8; n as usize];
                let _ = chan.recv_payload(&mut buf);
            },
            Op::RecvMemRequest => {
                let _ = chan.recv_struct::<MemRequest>(MemRequest::SIZE as i32);
            },
        }
    }
});

//! Per-request translation driver.
//!
//! Sequences decode → hash/probe → lift → calling-convention rewrite →
//! optimize → codegen → emit for one C_TRANSLATE, owning the lifetimes of
//! the per-request IR objects. The driver holds the connection exclusively
//! from the incoming request to the final S_OBJECT; memory requests are
//! strictly nested inside that window.

use std::{
    io::{Read, Write},
    time::Instant,
};

use rejit_proto::{CacheProbe, Channel, CodeHash, MsgId, ObjectInfo, ProtocolError};
use zerocopy::IntoBytes;

use crate::{
    error::ServerError,
    memproxy::MemProxy,
    module::PC_BASE_SYMBOL,
    pipeline::{DecodeError, GuestSource as _, Pipeline},
    session::Session,
};

/// Emit an S_OBJECT frame: info prefix plus the object image.
///
/// An empty `bytes` with a hash reports a cache hit; empty without a hash
/// marks the address permanently untranslatable.
pub(crate) fn send_object<S: Read + Write>(
    chan: &mut Channel<S>,
    bytes: &[u8],
    hash: Option<CodeHash>,
) -> rejit_proto::Result<()> {
    let info = ObjectInfo::new(hash);
    let size = i32::try_from(ObjectInfo::SIZE + bytes.len())
        .map_err(|_| ProtocolError::Malformed("object exceeds frame size limit"))?;
    chan.send_header(MsgId::SObject, size)?;
    chan.send_payload(info.as_bytes())?;
    chan.send_payload(bytes)
}

/// Ask the client whether it already holds an object for `(addr, hash)`.
fn cache_probe<S: Read + Write>(
    chan: &mut Channel<S>,
    addr: u64,
    hash: CodeHash,
) -> rejit_proto::Result<bool> {
    chan.send_struct(MsgId::SCacheProbe, &CacheProbe::new(addr, hash))?;
    let size = chan.consume_header(MsgId::CCacheStatus)?;
    if size != 1 {
        return Err(ProtocolError::SizeMismatch { expected: 1, got: size as usize });
    }
    let mut status = [0u8; 1];
    chan.recv_payload(&mut status)?;
    Ok(status[0] != 0)
}

/// Run the full pipeline for one translation request.
///
/// Decode and lift failures are reported to the client as empty objects and
/// return `Ok`; only connection-level and backend failures are errors.
pub fn translate<S: Read + Write>(
    session: &mut Session,
    pipeline: &mut Pipeline,
    chan: &mut Channel<S>,
    addr: u64,
) -> Result<(), ServerError> {
    let predecode_start = Instant::now();

    // Position-independent output expresses the address through relocations
    // against the base global; the lifter needs both per request.
    if session.options.pic {
        pipeline.lifter.set_pc_base(addr, PC_BASE_SYMBOL);
    }

    let decoded = {
        let mut proxy = MemProxy::new(chan);
        match pipeline.lifter.decode_cfg(addr, &mut proxy) {
            Ok(decoded) => decoded,
            Err(DecodeError::BadEntry { addr }) => {
                tracing::warn!("decode failed at {addr:#x}");
                send_object(chan, &[], None)?;
                return Ok(());
            },
            Err(DecodeError::Source(err)) => return Err(err.into()),
        }
    };

    // Address contributes to the hash only for position-dependent output;
    // relocatable objects must hash identically at any load address.
    let hash_addr: u64 = if session.options.pic { 0 } else { addr };
    session.hash.append(&hash_addr.to_ne_bytes());

    // Range bytes are re-fetched through the proxy so the hash reflects the
    // memory the decoder actually saw.
    for &range in decoded.ranges() {
        let rel_start = range.start.wrapping_sub(addr);
        let size = range.len();
        session.hash.append(&rel_start.to_ne_bytes());
        session.hash.append(&size.to_ne_bytes());

        let mut bytes = vec![0u8; size as usize];
        MemProxy::new(chan).read(range.start, &mut bytes)?;
        session.hash.append(&bytes);
    }

    let hash = session.hash.digest();
    session.hash.reset();

    if cache_probe(chan, addr, hash)? {
        drop(decoded);
        send_object(chan, &[], Some(hash))?;
        session.timers.predecode += predecode_start.elapsed();
        return Ok(());
    }

    let lift_start = Instant::now();
    let Some(func) = decoded.lift(&mut session.module) else {
        tracing::warn!("lift failed at {addr:#x}");
        send_object(chan, &[], None)?;
        return Ok(());
    };
    session.module.set_name(func, &format!("S0_{addr:x}"));
    if session.options.dump_ir.lift {
        tracing::debug!(stage = "lift", ir = %session.module.dump());
    }

    let callconv_start = Instant::now();
    session.module.set_call_conv(func, session.callconv());
    if session.options.dump_ir.cc {
        tracing::debug!(stage = "cc", ir = %session.module.dump());
    }

    let optimize_start = Instant::now();
    pipeline.optimizer.optimize(&mut session.module, func);
    if session.options.dump_ir.opt {
        tracing::debug!(stage = "opt", ir = %session.module.dump());
    }

    let codegen_start = Instant::now();
    pipeline.codegen.generate(&session.module, &mut session.obj_buf)?;
    if session.options.dump_ir.codegen {
        tracing::debug!(stage = "codegen", ir = %session.module.dump());
    }

    send_object(chan, &session.obj_buf, Some(hash))?;

    // Dead prototypes add compile-time overhead on every later request.
    session.module.prune_unused();
    debug_assert!(session.module.external_bodies().is_empty());

    let done = Instant::now();
    session.timers.predecode += lift_start - predecode_start;
    session.timers.lift += callconv_start - lift_start;
    session.timers.callconv += optimize_start - callconv_start;
    session.timers.optimize += codegen_start - optimize_start;
    session.timers.codegen += done - codegen_start;

    Ok(())
}

//! Self-contained reference pipeline over a flat block encoding.
//!
//! Deployments link a real lifter and compiler backend behind the pipeline
//! traits; this module provides a deterministic in-tree implementation for
//! bring-up and tests, the way a stub backend would behave:
//!
//! - a block is a byte sequence ending at the first `0xC3` (inclusive);
//! - a window that faults ends the block at the last nonzero byte;
//! - a block containing `0xEE` decodes but refuses to lift;
//! - the "object format" is a tagged symbol table over the module.
//!
//! None of this is machine code; it exists so every driver path (decode
//! failure, lift failure, faulted windows, cache hits) can be exercised
//! end-to-end with observable results.

use rejit_proto::MEMBUF_MAX;

use crate::{
    module::{FuncId, IrModule},
    pipeline::{
        CodeGen, CodeGenError, CodeRange, DecodeError, DecodedFunc, GuestSource, Lifter,
        LifterConfig, Optimizer,
    },
};

/// Block terminator byte.
pub const OP_RET: u8 = 0xC3;

/// Byte the lifter refuses to lift; decodes fine.
pub const OP_UNLIFTABLE: u8 = 0xEE;

/// Magic prefix of objects produced by [`BasicCodeGen`].
pub const OBJECT_MAGIC: &[u8; 4] = b"RJT0";

/// Linear block decoder and lifter over the flat encoding.
#[derive(Debug, Default)]
pub struct BasicLifter {
    config: Option<LifterConfig>,
    pc_base: Option<(u64, String)>,
}

impl BasicLifter {
    /// Unconfigured lifter; the session configures it at init.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Lifter for BasicLifter {
    fn append_config(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"basic-lifter/1\0");
        if let Some(config) = &self.config {
            buf.extend_from_slice(config.arch.lifter_name().as_bytes());
            buf.push(0);
            buf.push(u8::from(config.verify_ir));
            buf.push(u8::from(config.overflow_intrinsics));
            buf.push(u8::from(config.callret_clobber_flags));
        }
    }

    fn configure(&mut self, config: &LifterConfig) {
        self.config = Some(config.clone());
    }

    fn set_pc_base(&mut self, addr: u64, symbol: &str) {
        self.pc_base = Some((addr, symbol.to_owned()));
    }

    fn decode_cfg(
        &mut self,
        addr: u64,
        mem: &mut dyn GuestSource,
    ) -> Result<Box<dyn DecodedFunc>, DecodeError> {
        let mut window = vec![0u8; MEMBUF_MAX as usize];
        let status = mem.read(addr, &mut window)?;

        let len = match window.iter().position(|&b| b == OP_RET) {
            Some(pos) => pos + 1,
            None if status.is_fault() => {
                // Path runs off readable memory; keep the valid prefix.
                match window.iter().rposition(|&b| b != 0) {
                    Some(last) => last + 1,
                    None => return Err(DecodeError::BadEntry { addr }),
                }
            },
            None => window.len(),
        };
        window.truncate(len);

        Ok(Box::new(BasicDecoded {
            ranges: vec![CodeRange { start: addr, end: addr + len as u64 }],
            bytes: window,
        }))
    }
}

/// One decoded block, pending lift.
#[derive(Debug)]
struct BasicDecoded {
    ranges: Vec<CodeRange>,
    bytes: Vec<u8>,
}

impl DecodedFunc for BasicDecoded {
    fn ranges(&self) -> &[CodeRange] {
        &self.ranges
    }

    fn lift(self: Box<Self>, module: &mut IrModule) -> Option<FuncId> {
        if self.bytes.contains(&OP_UNLIFTABLE) {
            return None;
        }
        Some(module.add_function("lifted", self.bytes))
    }
}

/// Pass pipeline that leaves the body untouched.
///
/// The driver treats the optimizer as opaque; identity is the honest stub.
#[derive(Debug, Default)]
pub struct BasicOptimizer;

impl BasicOptimizer {
    /// Identity pass pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for BasicOptimizer {
    fn optimize(&mut self, _module: &mut IrModule, _func: FuncId) {}
}

/// Backend emitting a tagged symbol table as the "object image".
///
/// Layout: magic, then per live function `u8 name_len ∥ name ∥ u8 has_body
/// ∥ u8 callconv ∥ u32 body_len ∥ body`. Enough structure for tests to
/// check which symbols an object exports and how much code it covers.
#[derive(Debug, Default)]
pub struct BasicCodeGen;

impl BasicCodeGen {
    /// Fresh backend; stateless between calls.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl CodeGen for BasicCodeGen {
    fn append_config(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(b"basic-codegen/1\0");
    }

    fn generate(&mut self, module: &IrModule, out: &mut Vec<u8>) -> Result<(), CodeGenError> {
        out.clear();
        out.extend_from_slice(OBJECT_MAGIC);
        for func in module.functions() {
            let name_len = u8::try_from(func.name.len())
                .map_err(|_| CodeGenError { reason: format!("symbol too long: {}", func.name) })?;
            out.push(name_len);
            out.extend_from_slice(func.name.as_bytes());
            out.push(u8::from(func.has_body));
            out.push(func.callconv.to_wire() as u8);
            out.extend_from_slice(&(func.body.len() as u32).to_ne_bytes());
            out.extend_from_slice(func.body);
        }
        Ok(())
    }
}

/// Bundle the reference pipeline.
#[must_use]
pub fn basic_pipeline() -> super::Pipeline {
    super::Pipeline::new(
        Box::new(BasicLifter::new()),
        Box::new(BasicOptimizer::new()),
        Box::new(BasicCodeGen::new()),
    )
}

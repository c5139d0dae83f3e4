//! Interfaces of the external pipeline collaborators.
//!
//! The architecture lifter, the optimizer, and the compiler backend are
//! external to the translation core; the driver talks to them through
//! these traits. A production build links a real backend behind the seams,
//! [`basic`] provides the deterministic in-tree reference implementation.

use rejit_proto::{Arch, MemStatus};
use thiserror::Error;

use crate::module::{FuncId, IrModule};

pub mod basic;

/// Half-open range of guest memory consumed during decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeRange {
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl CodeRange {
    /// Byte length of the range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// True for the `(0, 0)` sentinel shape.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Source of guest memory for the decoder.
///
/// The server-side implementation round-trips every read through the
/// client; reads therefore block on socket I/O. A fault zero-fills `buf`
/// and reports [`MemStatus::Fault`] so the decoder can terminate the path.
pub trait GuestSource {
    /// Read `buf.len()` bytes at `addr`.
    fn read(&mut self, addr: u64, buf: &mut [u8]) -> rejit_proto::Result<MemStatus>;
}

/// Decode failure: the address does not begin a liftable block.
///
/// Reported to the client as an empty object with no hash; the session
/// itself continues. Transport failures inside the memory proxy are *not*
/// decode failures and travel separately.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No instruction could be decoded at the entry.
    #[error("decode failed at {addr:#x}")]
    BadEntry {
        /// Guest address the request named.
        addr: u64,
    },
    /// The memory proxy failed fatally (connection-level error).
    #[error(transparent)]
    Source(#[from] rejit_proto::ProtocolError),
}

/// Code generation failure; fatal for the session.
#[derive(Debug, Error)]
#[error("code generation failed: {reason}")]
pub struct CodeGenError {
    /// Backend-specific description.
    pub reason: String,
}

/// Session-constant lifter configuration, fixed at init.
#[derive(Debug, Clone)]
pub struct LifterConfig {
    /// Guest architecture.
    pub arch: Arch,
    /// Symbol of the syscall helper.
    pub syscall_helper: &'static str,
    /// Symbol of the call/tail helper when call-ret lifting is enabled.
    pub call_helper: Option<&'static str>,
    /// Symbol of the cpu-info helper (CPUID on x86-64).
    pub cpuinfo_helper: Option<&'static str>,
    /// Verify lifted IR before handing it to the optimizer.
    pub verify_ir: bool,
    /// Lower arithmetic flags through overflow intrinsics.
    pub overflow_intrinsics: bool,
    /// Allow call/ret lifting to clobber guest flags.
    pub callret_clobber_flags: bool,
}

/// The architecture lifter.
pub trait Lifter {
    /// Append the lifter's configuration bytes to the hash prefix.
    fn append_config(&self, buf: &mut Vec<u8>);

    /// Apply the session configuration once, before any decode.
    fn configure(&mut self, config: &LifterConfig);

    /// Point relocations at the pc-base global for the current request.
    ///
    /// Only called in PIC mode, once per request, before `decode_cfg`.
    fn set_pc_base(&mut self, addr: u64, symbol: &str);

    /// Decode the control-flow graph reachable from `addr`.
    ///
    /// Every byte the decoder looks at is fetched through `mem`; the
    /// decoder may suspend the caller on each access.
    fn decode_cfg(
        &mut self,
        addr: u64,
        mem: &mut dyn GuestSource,
    ) -> Result<Box<dyn DecodedFunc>, DecodeError>;
}

/// A decoded, not yet lifted function.
pub trait DecodedFunc: std::fmt::Debug {
    /// Byte ranges the decoder actually consumed, in decode order.
    fn ranges(&self) -> &[CodeRange];

    /// Lift into IR, appending the function to `module`.
    ///
    /// `None` reports a lift failure; the decoded state is consumed either
    /// way.
    fn lift(self: Box<Self>, module: &mut IrModule) -> Option<FuncId>;
}

/// The optimization pass pipeline; opaque to the driver.
pub trait Optimizer {
    /// Optimize one function in place.
    fn optimize(&mut self, module: &mut IrModule, func: FuncId);
}

/// The compiler backend.
pub trait CodeGen {
    /// Append the backend's configuration bytes to the hash prefix.
    fn append_config(&self, buf: &mut Vec<u8>);

    /// Lower the module, replacing `out` with the relocatable object image.
    fn generate(&mut self, module: &IrModule, out: &mut Vec<u8>) -> Result<(), CodeGenError>;
}

/// The three collaborators the driver sequences per request.
pub struct Pipeline {
    /// Architecture lifter.
    pub lifter: Box<dyn Lifter>,
    /// Optimization pipeline.
    pub optimizer: Box<dyn Optimizer>,
    /// Compiler backend.
    pub codegen: Box<dyn CodeGen>,
}

impl Pipeline {
    /// Bundle the collaborators.
    #[must_use]
    pub fn new(
        lifter: Box<dyn Lifter>,
        optimizer: Box<dyn Optimizer>,
        codegen: Box<dyn CodeGen>,
    ) -> Self {
        Self { lifter, optimizer, codegen }
    }
}

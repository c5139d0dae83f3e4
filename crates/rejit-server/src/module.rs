//! Ownership model for the session's long-lived IR module.
//!
//! The module is an export-only skeleton: it owns the program-counter base
//! global and the helper declarations for the whole session, and lifted
//! function bodies pass through it only between lift and emit. Compiled
//! objects reference helpers by symbol, so the module must never retain an
//! external-linkage body once an object has been emitted.

use rejit_proto::CallConv;

/// Symbol of the relocation base global for position-independent output.
pub const PC_BASE_SYMBOL: &str = "rejit_baseaddr";

/// Handle to a function slot inside an [`IrModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncId(usize);

/// Symbol linkage of a module function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Visible to the client's loader; helpers and emitted entry points.
    External,
    /// Module-private; never exported.
    Internal,
}

/// One function slot: symbol, linkage, body, and pinning.
///
/// The body payload is opaque to the module (the lifter produces it, the
/// backend consumes it). Pinned functions (the helper set) survive
/// [`IrModule::prune_unused`]; everything else is erased once it has no
/// users.
#[derive(Debug, Clone)]
struct IrFunc {
    name: String,
    linkage: Linkage,
    has_body: bool,
    body: Vec<u8>,
    callconv: CallConv,
    pinned: bool,
}

/// Read-only view of one live function, consumed by the backend.
#[derive(Debug, Clone, Copy)]
pub struct FuncView<'a> {
    /// Symbol name.
    pub name: &'a str,
    /// Whether the function still carries a body.
    pub has_body: bool,
    /// Opaque body payload; empty for declarations and skeletons.
    pub body: &'a [u8],
    /// Convention the function is entered with.
    pub callconv: CallConv,
}

/// The session-scoped module: pc-base global plus a function table.
#[derive(Debug)]
pub struct IrModule {
    funcs: Vec<Option<IrFunc>>,
    stack_alignment: u32,
}

impl IrModule {
    /// Empty module for one session.
    #[must_use]
    pub fn new(stack_alignment: u32) -> Self {
        Self { funcs: Vec::new(), stack_alignment }
    }

    /// Stack alignment override the backend must honor; 0 = default.
    #[must_use]
    pub fn stack_alignment(&self) -> u32 {
        self.stack_alignment
    }

    /// Declare a persistent helper: external linkage, pinned.
    ///
    /// Helpers carry a skeleton body until the bootstrap emit, after which
    /// [`IrModule::strip_external_bodies`] reduces them to declarations.
    pub fn declare_helper(&mut self, name: &str) -> FuncId {
        self.push(IrFunc {
            name: name.to_owned(),
            linkage: Linkage::External,
            has_body: true,
            body: Vec::new(),
            callconv: CallConv::Cdecl,
            pinned: true,
        })
    }

    /// Insert a freshly lifted function under a placeholder name.
    pub fn add_function(&mut self, name: &str, body: Vec<u8>) -> FuncId {
        self.push(IrFunc {
            name: name.to_owned(),
            linkage: Linkage::External,
            has_body: true,
            body,
            callconv: CallConv::Cdecl,
            pinned: false,
        })
    }

    fn push(&mut self, func: IrFunc) -> FuncId {
        self.funcs.push(Some(func));
        FuncId(self.funcs.len() - 1)
    }

    /// Rename a function; emitted entry points become `S0_<hex addr>`.
    pub fn set_name(&mut self, id: FuncId, name: &str) {
        if let Some(func) = self.funcs.get_mut(id.0).and_then(Option::as_mut) {
            func.name = name.to_owned();
        }
    }

    /// Symbol of a function.
    #[must_use]
    pub fn name(&self, id: FuncId) -> Option<&str> {
        self.funcs.get(id.0).and_then(Option::as_ref).map(|f| f.name.as_str())
    }

    /// Rewrite the convention translated code is entered with.
    pub fn set_call_conv(&mut self, id: FuncId, callconv: CallConv) {
        if let Some(func) = self.funcs.get_mut(id.0).and_then(Option::as_mut) {
            func.callconv = callconv;
        }
    }

    /// Calling convention of a function.
    #[must_use]
    pub fn call_conv(&self, id: FuncId) -> Option<CallConv> {
        self.funcs.get(id.0).and_then(Option::as_ref).map(|f| f.callconv)
    }

    /// Body payload of a function, when it still carries one.
    #[must_use]
    pub fn body(&self, id: FuncId) -> Option<&[u8]> {
        self.funcs
            .get(id.0)
            .and_then(Option::as_ref)
            .filter(|f| f.has_body)
            .map(|f| f.body.as_slice())
    }

    /// Drop the bodies of all external-linkage functions.
    ///
    /// Run once after the bootstrap emit: helpers stay declared, but their
    /// skeleton bodies must not be compiled into any later object.
    pub fn strip_external_bodies(&mut self) {
        for func in self.funcs.iter_mut().flatten() {
            if func.linkage == Linkage::External && func.has_body {
                func.has_body = false;
                func.body.clear();
            }
        }
    }

    /// Erase every unpinned function.
    ///
    /// Run after each emit; keeps the function-table footprint roughly
    /// constant across a session.
    pub fn prune_unused(&mut self) {
        for slot in &mut self.funcs {
            if slot.as_ref().is_some_and(|f| !f.pinned) {
                *slot = None;
            }
        }
    }

    /// Names of external-linkage functions that still carry a body.
    ///
    /// Empty outside the lift→emit window; the driver asserts this after
    /// every request.
    #[must_use]
    pub fn external_bodies(&self) -> Vec<&str> {
        self.funcs
            .iter()
            .flatten()
            .filter(|f| f.linkage == Linkage::External && f.has_body && !f.pinned)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Iterate live function symbols with body presence, declaration order.
    pub fn symbols(&self) -> impl Iterator<Item = (&str, bool)> {
        self.funcs.iter().flatten().map(|f| (f.name.as_str(), f.has_body))
    }

    /// Iterate live functions as backend-facing views, declaration order.
    pub fn functions(&self) -> impl Iterator<Item = FuncView<'_>> {
        self.funcs.iter().flatten().map(|f| FuncView {
            name: f.name.as_str(),
            has_body: f.has_body,
            body: f.body.as_slice(),
            callconv: f.callconv,
        })
    }

    /// Number of live function slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs.iter().flatten().count()
    }

    /// True when the function table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One-line rendering of the function table for IR dumps.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        out.push_str(PC_BASE_SYMBOL);
        for (name, has_body) in self.symbols() {
            out.push(' ');
            out.push_str(name);
            out.push(if has_body { '!' } else { '?' });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_survive_pruning() {
        let mut module = IrModule::new(16);
        module.declare_helper("syscall");
        module.declare_helper("cpuid");
        module.strip_external_bodies();

        let lifted = module.add_function("lifted", vec![0x90, 0xc3]);
        module.set_name(lifted, "S0_401000");
        assert_eq!(module.body(lifted), Some(&[0x90, 0xc3][..]));
        assert_eq!(module.len(), 3);

        module.prune_unused();
        assert_eq!(module.len(), 2);
        assert!(module.external_bodies().is_empty());
    }

    #[test]
    fn strip_leaves_declarations() {
        let mut module = IrModule::new(0);
        module.declare_helper("syscall_rv64");
        module.strip_external_bodies();
        let bodies: Vec<_> = module.symbols().filter(|(_, body)| *body).collect();
        assert!(bodies.is_empty());
        assert_eq!(module.len(), 1);
    }

    #[test]
    fn lifted_function_is_the_only_external_body() {
        let mut module = IrModule::new(0);
        module.declare_helper("syscall");
        module.strip_external_bodies();

        let id = module.add_function("pending", vec![0xc3]);
        assert_eq!(module.external_bodies(), vec!["pending"]);
        module.set_call_conv(id, CallConv::FastX86);
        assert_eq!(module.call_conv(id), Some(CallConv::FastX86));

        module.prune_unused();
        assert!(module.external_bodies().is_empty());
    }
}

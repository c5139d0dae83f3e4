//! Per-connection session state.
//!
//! Immutable for the connection: the config snapshot from C_INIT, the
//! negotiated calling convention, and the hash-config prefix. Mutable: the
//! IR module (pc-base global + helper declarations), the object output
//! buffer reused across requests, and the stage timing accumulators.

use std::time::Duration;

use rejit_proto::{Arch, CallConv, ClientConfig, ServerConfig};
use zerocopy::IntoBytes;

use crate::{
    error::ServerError,
    hash::{HASH_CONFIG_VERSION, HashBuilder, HashConfig},
    module::IrModule,
    pipeline::{LifterConfig, Pipeline},
};

/// Symbol of the call/tail helper used when call-ret lifting is enabled.
pub const CALL_HELPER_SYMBOL: &str = "rejit_call_cdecl";

/// Symbol of the cpu-info helper on x86-64 guests.
pub const CPUINFO_SYMBOL: &str = "cpuid";

/// Which pipeline stages dump IR to the diagnostic stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStages {
    /// After lifting.
    pub lift: bool,
    /// After the calling-convention rewrite.
    pub cc: bool,
    /// After optimization.
    pub opt: bool,
    /// After code generation.
    pub codegen: bool,
}

/// Server-side behavior switches, fixed before the session starts.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Accumulate and report per-stage timing.
    pub profile: bool,
    /// Tell the client to trace dispatches.
    pub trace: bool,
    /// Perf-integration mode forwarded to the client (0, 1, 2).
    pub perf: u8,
    /// Emit position-independent objects.
    pub pic: bool,
    /// Negotiate the register-based calling convention when available.
    pub fastcc: bool,
    /// Lift guest call/ret through the call helper.
    pub callret: bool,
    /// Keep guest flags intact across call/ret.
    pub safe_call_ret: bool,
    /// Verify lifted IR before optimizing.
    pub verify_lifted: bool,
    /// IR dump selection.
    pub dump_ir: DumpStages,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            profile: false,
            trace: false,
            perf: 0,
            pic: false,
            fastcc: true,
            callret: false,
            safe_call_ret: false,
            verify_lifted: false,
            dump_ir: DumpStages::default(),
        }
    }
}

/// Accumulated wall-clock time per pipeline stage.
#[derive(Debug, Default)]
pub struct StageTimers {
    /// Decode, hash build, and cache probe.
    pub predecode: Duration,
    /// Lifting into IR.
    pub lift: Duration,
    /// Calling-convention rewrite.
    pub callconv: Duration,
    /// Optimization passes.
    pub optimize: Duration,
    /// Code generation.
    pub codegen: Duration,
}

impl StageTimers {
    /// Log the accumulated durations; called once at session teardown.
    pub fn report(&self) {
        tracing::info!(
            predecode_ms = self.predecode.as_millis() as u64,
            lift_ms = self.lift.as_millis() as u64,
            callconv_ms = self.callconv.as_millis() as u64,
            optimize_ms = self.optimize.as_millis() as u64,
            codegen_ms = self.codegen.as_millis() as u64,
            "server profile"
        );
    }
}

/// State owned by one connection, from C_INIT to teardown.
#[derive(Debug)]
pub struct Session {
    guest: Arch,
    host: Arch,
    callconv: CallConv,
    pub(crate) options: ServerOptions,
    pub(crate) module: IrModule,
    pub(crate) hash: HashBuilder,
    pub(crate) obj_buf: Vec<u8>,
    pub(crate) timers: StageTimers,
}

impl Session {
    /// Build the session from the client's init config.
    ///
    /// Declares the helper set for the guest architecture, configures the
    /// lifter, and negotiates the calling convention. An unsupported guest
    /// or host architecture is fatal here, before S_INIT is ever sent.
    pub fn new(
        config: &ServerConfig,
        options: ServerOptions,
        pipeline: &mut Pipeline,
    ) -> Result<(Self, ClientConfig), ServerError> {
        let guest =
            Arch::from_elf(config.guest_arch).ok_or(ServerError::UnsupportedArch(config.guest_arch))?;
        let host =
            Arch::from_elf(config.host_arch).ok_or(ServerError::UnsupportedArch(config.host_arch))?;

        let mut module = IrModule::new(config.stack_alignment);

        let call_helper = options.callret.then(|| {
            module.declare_helper(CALL_HELPER_SYMBOL);
            CALL_HELPER_SYMBOL
        });
        module.declare_helper(guest.syscall_helper());
        let cpuinfo_helper = (guest == Arch::X86_64).then(|| {
            module.declare_helper(CPUINFO_SYMBOL);
            CPUINFO_SYMBOL
        });

        pipeline.lifter.configure(&LifterConfig {
            arch: guest,
            syscall_helper: guest.syscall_helper(),
            call_helper,
            cpuinfo_helper,
            verify_ir: options.verify_lifted,
            overflow_intrinsics: false,
            callret_clobber_flags: !options.safe_call_ret,
        });

        let callconv = if options.fastcc {
            CallConv::fast_for(host, guest).unwrap_or_default()
        } else {
            CallConv::Cdecl
        };

        let client_config = ClientConfig {
            callconv: callconv.to_wire(),
            profile: u8::from(options.profile),
            perf: options.perf,
            trace: u8::from(options.trace),
            reserved: 0,
        };

        tracing::debug!(?guest, ?host, ?callconv, "session configured");

        let session = Session {
            guest,
            host,
            callconv,
            options,
            module,
            hash: HashBuilder::new(),
            obj_buf: Vec::new(),
            timers: StageTimers::default(),
        };
        Ok((session, client_config))
    }

    /// Guest architecture for this session.
    #[must_use]
    pub fn guest(&self) -> Arch {
        self.guest
    }

    /// Host architecture for this session.
    #[must_use]
    pub fn host(&self) -> Arch {
        self.host
    }

    /// Negotiated calling convention.
    #[must_use]
    pub fn callconv(&self) -> CallConv {
        self.callconv
    }

    /// The sealed hash-config prefix; byte-identical across requests.
    #[must_use]
    pub fn hash_prefix(&self) -> &[u8] {
        self.hash.prefix()
    }

    /// The session module.
    #[must_use]
    pub fn module(&self) -> &IrModule {
        &self.module
    }

    /// Generate the bootstrap object and seal the hash prefix.
    ///
    /// The bootstrap object carries the helper skeleton and is emitted with
    /// address 0 and no hash; the client treats it as an init-only payload
    /// and never caches it. Afterwards every external-linkage body is
    /// stripped and the hash prefix is built from the fixed config record
    /// plus the lifter's and the backend's config bytes.
    pub(crate) fn bootstrap(&mut self, pipeline: &mut Pipeline) -> Result<(), ServerError> {
        pipeline.codegen.generate(&self.module, &mut self.obj_buf)?;
        self.module.strip_external_bodies();

        let record = HashConfig {
            version: HASH_CONFIG_VERSION,
            safe_call_ret: u8::from(self.options.safe_call_ret),
            enable_callret: u8::from(self.options.callret),
            enable_fastcc: u8::from(self.options.fastcc),
            enable_pic: u8::from(self.options.pic),
            guest_arch: self.guest.to_elf(),
            host_arch: self.host.to_elf(),
            stack_alignment: self.module.stack_alignment(),
        };
        let mut prefix = Vec::new();
        prefix.extend_from_slice(record.as_bytes());
        pipeline.lifter.append_config(&mut prefix);
        pipeline.codegen.append_config(&mut prefix);
        self.hash.append(&prefix);
        self.hash.seal_prefix();

        Ok(())
    }

    /// Session teardown: report timing when profiling is on.
    pub fn finish(self) {
        if self.options.profile {
            self.timers.report();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::basic::basic_pipeline;

    fn config(guest: Arch) -> ServerConfig {
        ServerConfig { guest_arch: guest.to_elf(), host_arch: Arch::X86_64.to_elf(), stack_alignment: 16 }
    }

    #[test]
    fn unsupported_guest_arch_is_fatal() {
        let bad = ServerConfig { guest_arch: 3, host_arch: 62, stack_alignment: 0 };
        let err = Session::new(&bad, ServerOptions::default(), &mut basic_pipeline()).unwrap_err();
        assert!(matches!(err, ServerError::UnsupportedArch(3)));
    }

    #[test]
    fn x86_guest_declares_syscall_and_cpuid() {
        let (session, _) =
            Session::new(&config(Arch::X86_64), ServerOptions::default(), &mut basic_pipeline())
                .unwrap();
        let names: Vec<_> = session.module().symbols().map(|(name, _)| name.to_owned()).collect();
        assert_eq!(names, vec!["syscall", "cpuid"]);
    }

    #[test]
    fn rv64_guest_declares_arch_syscall_only() {
        let (session, _) =
            Session::new(&config(Arch::Rv64), ServerOptions::default(), &mut basic_pipeline())
                .unwrap();
        let names: Vec<_> = session.module().symbols().map(|(name, _)| name.to_owned()).collect();
        assert_eq!(names, vec!["syscall_rv64"]);
    }

    #[test]
    fn callret_adds_the_call_helper_first() {
        let options = ServerOptions { callret: true, ..ServerOptions::default() };
        let (session, _) =
            Session::new(&config(Arch::Aarch64), options, &mut basic_pipeline()).unwrap();
        let names: Vec<_> = session.module().symbols().map(|(name, _)| name.to_owned()).collect();
        assert_eq!(names, vec![CALL_HELPER_SYMBOL, "syscall_aarch64"]);
    }

    #[test]
    fn fastcc_negotiation_follows_the_pair() {
        let (session, client_config) =
            Session::new(&config(Arch::Rv64), ServerOptions::default(), &mut basic_pipeline())
                .unwrap();
        assert_eq!(session.callconv(), CallConv::FastRv64);
        assert_eq!(client_config.callconv, CallConv::FastRv64.to_wire());

        let options = ServerOptions { fastcc: false, ..ServerOptions::default() };
        let (session, client_config) =
            Session::new(&config(Arch::Rv64), options, &mut basic_pipeline()).unwrap();
        assert_eq!(session.callconv(), CallConv::Cdecl);
        assert_eq!(client_config.callconv, CallConv::Cdecl.to_wire());
    }

    #[test]
    fn bootstrap_seals_a_stable_prefix_and_strips_bodies() {
        let mut pipeline = basic_pipeline();
        let (mut session, _) =
            Session::new(&config(Arch::X86_64), ServerOptions::default(), &mut pipeline).unwrap();
        session.bootstrap(&mut pipeline).unwrap();
        assert!(!session.obj_buf.is_empty());

        assert!(session.module().external_bodies().is_empty());
        let prefix = session.hash_prefix().to_vec();
        assert!(prefix.len() > 20);
        assert!(prefix.ends_with(b"basic-codegen/1\0"));

        // The prefix stays intact across request-shaped mutations.
        session.hash.append(&[1, 2, 3]);
        session.hash.reset();
        assert_eq!(session.hash_prefix(), prefix.as_slice());
    }
}

//! Guest/host architectures and calling conventions.
//!
//! Architectures travel on the wire as ELF machine numbers inside the init
//! configs; the negotiated calling convention travels back as a small code
//! the client's dispatcher understands.

/// Instruction-set architecture, identified by its ELF machine number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Arch {
    /// x86-64 (`EM_X86_64`).
    X86_64 = 62,
    /// AArch64 (`EM_AARCH64`).
    Aarch64 = 183,
    /// RV64 (`EM_RISCV`).
    Rv64 = 243,
}

impl Arch {
    /// Decode an ELF machine number. `None` for unsupported architectures.
    #[must_use]
    pub fn from_elf(machine: u32) -> Option<Self> {
        match machine {
            62 => Some(Self::X86_64),
            183 => Some(Self::Aarch64),
            243 => Some(Self::Rv64),
            _ => None,
        }
    }

    /// ELF machine number for the wire configs.
    #[must_use]
    pub fn to_elf(self) -> u32 {
        self as u32
    }

    /// Architecture name as the lifter expects it.
    #[must_use]
    pub fn lifter_name(self) -> &'static str {
        match self {
            Self::X86_64 => "x86-64",
            Self::Aarch64 => "aarch64",
            Self::Rv64 => "rv64",
        }
    }

    /// Symbol of the syscall helper the lifted code calls on this guest.
    #[must_use]
    pub fn syscall_helper(self) -> &'static str {
        match self {
            Self::X86_64 => "syscall",
            Self::Aarch64 => "syscall_aarch64",
            Self::Rv64 => "syscall_rv64",
        }
    }
}

/// Calling convention for entering translated code.
///
/// The fast conventions hand the guest register file to the callee in
/// specific host registers; there is exactly one fast convention per
/// supported (host, guest) pair. `Cdecl` is the portable fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum CallConv {
    /// Plain C convention; guest state passed behind a pointer.
    #[default]
    Cdecl = 0,
    /// Register-based convention for x86-64 guests on x86-64 hosts.
    FastX86 = 1,
    /// Register-based convention for RV64 guests on x86-64 hosts.
    FastRv64 = 2,
    /// Register-based convention for AArch64 guests on x86-64 hosts.
    FastAarch64 = 3,
}

impl CallConv {
    /// Wire code carried in the S_INIT client config.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    /// Decode a wire code. `None` for unknown codes.
    #[must_use]
    pub fn from_wire(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Cdecl),
            1 => Some(Self::FastX86),
            2 => Some(Self::FastRv64),
            3 => Some(Self::FastAarch64),
            _ => None,
        }
    }

    /// The fast convention for a (host, guest) pair, if one exists.
    #[must_use]
    pub fn fast_for(host: Arch, guest: Arch) -> Option<Self> {
        match (host, guest) {
            (Arch::X86_64, Arch::X86_64) => Some(Self::FastX86),
            (Arch::X86_64, Arch::Rv64) => Some(Self::FastRv64),
            (Arch::X86_64, Arch::Aarch64) => Some(Self::FastAarch64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elf_numbers_round_trip() {
        for arch in [Arch::X86_64, Arch::Aarch64, Arch::Rv64] {
            assert_eq!(Arch::from_elf(arch.to_elf()), Some(arch));
        }
        assert_eq!(Arch::from_elf(3), None);
    }

    #[test]
    fn fast_cc_only_on_x86_hosts() {
        assert_eq!(CallConv::fast_for(Arch::X86_64, Arch::X86_64), Some(CallConv::FastX86));
        assert_eq!(CallConv::fast_for(Arch::X86_64, Arch::Rv64), Some(CallConv::FastRv64));
        assert_eq!(CallConv::fast_for(Arch::Aarch64, Arch::X86_64), None);
    }

    #[test]
    fn wire_codes_round_trip() {
        for cc in [CallConv::Cdecl, CallConv::FastX86, CallConv::FastRv64, CallConv::FastAarch64] {
            assert_eq!(CallConv::from_wire(cc.to_wire()), Some(cc));
        }
        assert_eq!(CallConv::from_wire(9), None);
    }
}

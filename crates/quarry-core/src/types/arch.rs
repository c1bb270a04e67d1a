//! Target architecture description.

use std::fmt;

/// CPU architecture of the debuggee
///
/// Determines pointer width and the DWARF register numbering used by unwind
/// rules and location expressions.
///
/// ## DWARF register numbers
///
/// | Role            | x86-64   | ARM64     |
/// |-----------------|----------|-----------|
/// | Program counter | 16 (RIP) | 32 (PC)   |
/// | Stack pointer   | 7 (RSP)  | 31 (SP)   |
/// | Frame pointer   | 6 (RBP)  | 29 (X29)  |
/// | Link register   | none     | 30 (X30)  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit ARM
    Arm64,
    /// 64-bit x86 (Intel/AMD)
    X86_64,
}

impl Architecture
{
    /// Architecture of the running debugger, a reasonable default target.
    pub const fn current() -> Self
    {
        #[cfg(target_arch = "aarch64")]
        {
            Architecture::Arm64
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            Architecture::X86_64
        }
    }

    /// Size of a pointer in bytes.
    #[must_use]
    pub const fn pointer_size(self) -> u8
    {
        match self {
            Architecture::Arm64 | Architecture::X86_64 => 8,
        }
    }

    /// DWARF number of the program counter.
    #[must_use]
    pub const fn pc_register(self) -> u16
    {
        match self {
            Architecture::Arm64 => 32,
            Architecture::X86_64 => 16,
        }
    }

    /// DWARF number of the stack pointer.
    #[must_use]
    pub const fn sp_register(self) -> u16
    {
        match self {
            Architecture::Arm64 => 31,
            Architecture::X86_64 => 7,
        }
    }

    /// DWARF number of the frame pointer.
    #[must_use]
    pub const fn bp_register(self) -> u16
    {
        match self {
            Architecture::Arm64 => 29,
            Architecture::X86_64 => 6,
        }
    }

    /// DWARF number of the link register, where the ISA has one.
    #[must_use]
    pub const fn link_register(self) -> Option<u16>
    {
        match self {
            Architecture::Arm64 => Some(30),
            Architecture::X86_64 => None,
        }
    }

    /// Register holding the return address in CIEs produced for this target.
    #[must_use]
    pub const fn return_address_register(self) -> u16
    {
        match self {
            Architecture::Arm64 => 30,
            Architecture::X86_64 => 16,
        }
    }

    /// Highest DWARF register number tracked for unwinding, plus one.
    #[must_use]
    pub const fn dwarf_register_count(self) -> usize
    {
        match self {
            Architecture::Arm64 => 33,
            Architecture::X86_64 => 17,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::Arm64 => write!(f, "arm64"),
            Architecture::X86_64 => write!(f, "x86_64"),
        }
    }
}

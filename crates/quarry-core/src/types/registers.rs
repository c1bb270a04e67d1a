//! Thread register snapshots handed over by the process-control layer.

use super::{Address, Architecture, DwarfRegisters};

/// x86-64 general-purpose register
///
/// RSP, RBP and RIP live in [`Registers::sp`], [`Registers::fp`] and
/// [`Registers::pc`].
///
/// ```rust
/// use quarry_core::types::{Architecture, Registers, X86_64Register};
///
/// let mut snapshot = Registers::new(Architecture::X86_64);
/// snapshot.set_x86_64(X86_64Register::Rbx, 0xbb);
/// assert_eq!(snapshot.dwarf_registers().reg(3), Some(0xbb));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum X86_64Register
{
    Rax,
    Rdx,
    Rcx,
    Rbx,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl X86_64Register
{
    /// DWARF register number from the System V x86-64 psABI.
    pub const fn dwarf_number(self) -> u16
    {
        match self {
            X86_64Register::Rax => 0,
            X86_64Register::Rdx => 1,
            X86_64Register::Rcx => 2,
            X86_64Register::Rbx => 3,
            X86_64Register::Rsi => 4,
            X86_64Register::Rdi => 5,
            X86_64Register::R8 => 8,
            X86_64Register::R9 => 9,
            X86_64Register::R10 => 10,
            X86_64Register::R11 => 11,
            X86_64Register::R12 => 12,
            X86_64Register::R13 => 13,
            X86_64Register::R14 => 14,
            X86_64Register::R15 => 15,
        }
    }
}

/// Register snapshot of a stopped thread
///
/// This is what the process-control collaborator hands over when a thread
/// stops. The unwinder never works on it directly; it converts it once with
/// [`Registers::dwarf_registers`] and then only deals in DWARF numbering.
/// Registers the collaborator did not capture stay absent rather than zero.
#[derive(Debug, Clone)]
pub struct Registers
{
    pub pc: Address,
    pub sp: Address,
    /// RBP on x86-64, X29 on ARM64
    pub fp: Address,
    /// Indexed by DWARF number: 0-15 on x86-64, X0-X30 on ARM64
    general: Vec<Option<u64>>,
    architecture: Architecture,
}

impl Registers
{
    pub fn new(architecture: Architecture) -> Self
    {
        let count = match architecture {
            Architecture::X86_64 => 16,
            Architecture::Arm64 => 31,
        };
        Self {
            pc: Address::ZERO,
            sp: Address::ZERO,
            fp: Address::ZERO,
            general: vec![None; count],
            architecture,
        }
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Record an x86-64 register. Ignored on other architectures.
    pub fn set_x86_64(&mut self, reg: X86_64Register, value: u64)
    {
        if self.architecture == Architecture::X86_64 {
            self.set_general(reg.dwarf_number(), value);
        }
    }

    /// Record an ARM64 `Xn` register; `n` past 30 is ignored.
    pub fn set_arm64(&mut self, n: u8, value: u64)
    {
        if self.architecture == Architecture::Arm64 {
            self.set_general(u16::from(n), value);
        }
    }

    /// General-purpose register by DWARF number.
    pub fn general(&self, number: u16) -> Option<u64>
    {
        self.general.get(usize::from(number)).copied().flatten()
    }

    fn set_general(&mut self, number: u16, value: u64)
    {
        if let Some(slot) = self.general.get_mut(usize::from(number)) {
            *slot = Some(value);
        }
    }

    /// Convert into the DWARF-numbered form used by unwinding and location
    /// expressions.
    pub fn dwarf_registers(&self) -> DwarfRegisters
    {
        let mut regs = DwarfRegisters::new(self.architecture);
        for (number, value) in self.general.iter().enumerate() {
            if let Some(value) = value {
                regs.add_reg(number as u16, *value);
            }
        }
        regs.set_pc(self.pc.value());
        regs.set_sp(self.sp.value());
        regs.set_bp(self.fp.value());
        regs
    }
}

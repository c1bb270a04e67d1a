//! DWARF-numbered register sets used while unwinding and evaluating locations.

use smallvec::SmallVec;

use super::{Architecture, Registers};

/// Register values of one frame, indexed by DWARF register number
///
/// Unlike a thread's [`Registers`] snapshot, a recovered caller frame usually
/// knows only some of its registers: callee-saved registers with a recovery
/// rule, the stack pointer (implicitly the CFA) and the program counter.
/// Registers whose rule is undefined are *absent*, not zero.
///
/// The set also carries the two derived values location expressions need:
/// the canonical frame address and the function's frame base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwarfRegisters
{
    architecture: Architecture,
    regs: SmallVec<[Option<u64>; 32]>,
    /// Canonical frame address of this frame, once computed
    pub cfa: i64,
    /// Value of the owning function's frame base expression
    pub frame_base: i64,
}

impl DwarfRegisters
{
    /// Create an empty register set for `architecture`.
    pub fn new(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            regs: SmallVec::new(),
            cfa: 0,
            frame_base: 0,
        }
    }

    /// Create a register set holding only the three registers every frame has.
    pub fn with_frame(architecture: Architecture, pc: u64, sp: u64, bp: u64) -> Self
    {
        let mut regs = Self::new(architecture);
        regs.set_pc(pc);
        regs.set_sp(sp);
        regs.set_bp(bp);
        regs
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Value of register `number`, or `None` when it is not known.
    pub fn reg(&self, number: u16) -> Option<u64>
    {
        self.regs.get(usize::from(number)).copied().flatten()
    }

    /// Set or clear register `number`.
    pub fn set_reg(&mut self, number: u16, value: Option<u64>)
    {
        let index = usize::from(number);
        if index >= self.regs.len() {
            if value.is_none() {
                return;
            }
            self.regs.resize(index + 1, None);
        }
        self.regs[index] = value;
    }

    /// Record a known value for register `number`.
    pub fn add_reg(&mut self, number: u16, value: u64)
    {
        self.set_reg(number, Some(value));
    }

    /// Little-endian bytes of register `number`, for piece composition.
    pub fn reg_bytes(&self, number: u16) -> Option<[u8; 8]>
    {
        self.reg(number).map(u64::to_le_bytes)
    }

    pub fn pc(&self) -> u64
    {
        self.reg(self.architecture.pc_register()).unwrap_or(0)
    }

    pub fn sp(&self) -> u64
    {
        self.reg(self.architecture.sp_register()).unwrap_or(0)
    }

    pub fn bp(&self) -> u64
    {
        self.reg(self.architecture.bp_register()).unwrap_or(0)
    }

    pub fn set_pc(&mut self, value: u64)
    {
        self.add_reg(self.architecture.pc_register(), value);
    }

    pub fn set_sp(&mut self, value: u64)
    {
        self.add_reg(self.architecture.sp_register(), value);
    }

    pub fn set_bp(&mut self, value: u64)
    {
        self.add_reg(self.architecture.bp_register(), value);
    }

    /// Iterate over the known registers as `(number, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u64)> + '_
    {
        self.regs
            .iter()
            .enumerate()
            .filter_map(|(number, value)| value.map(|value| (number as u16, value)))
    }
}

impl From<&Registers> for DwarfRegisters
{
    fn from(snapshot: &Registers) -> Self
    {
        snapshot.dwarf_registers()
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_absent_registers_are_not_zero()
    {
        let mut regs = DwarfRegisters::new(Architecture::X86_64);
        regs.add_reg(3, 0);
        assert_eq!(regs.reg(3), Some(0));
        assert_eq!(regs.reg(4), None);
        assert_eq!(regs.reg(200), None);
    }

    #[test]
    fn test_clearing_beyond_end_does_not_grow()
    {
        let mut regs = DwarfRegisters::new(Architecture::Arm64);
        regs.set_reg(40, None);
        assert_eq!(regs.iter().count(), 0);
        regs.set_reg(40, Some(7));
        assert_eq!(regs.iter().collect::<Vec<_>>(), vec![(40, 7)]);
    }

    #[test]
    fn test_frame_registers_use_architecture_numbers()
    {
        let regs = DwarfRegisters::with_frame(Architecture::Arm64, 0x1000, 0x2000, 0x3000);
        assert_eq!(regs.reg(32), Some(0x1000));
        assert_eq!(regs.reg(31), Some(0x2000));
        assert_eq!(regs.reg(29), Some(0x3000));
        assert_eq!(regs.pc(), 0x1000);
    }
}

//! Register recovery rules and the lookup interface that supplies them.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::error::{QuarryError, QuarryResult};

/// How to recover one register (or the CFA) of the calling frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRule
{
    /// The register cannot be recovered; it is absent in the caller
    Undefined,
    /// The caller's value equals the callee's
    SameValue,
    /// Saved in memory at `CFA + offset`
    Offset(i64),
    /// The value is `CFA + offset` itself
    ValOffset(i64),
    /// Saved in another register
    Register(u16),
    /// Saved in memory at the address computed by a DWARF expression
    Expression(Vec<u8>),
    /// The value is computed by a DWARF expression
    ValExpression(Vec<u8>),
    /// Defined by the ABI; not supported
    Architectural,
    /// `register + offset`, the usual way to define the CFA
    Cfa
    {
        register: u16,
        offset: i64,
    },
    /// Frame pointer chase: read through the register if it points into the
    /// callee frame, otherwise keep it
    FramePointer(u16),
}

impl FrameRule
{
    /// Offset component of the rule, zero for rules without one.
    pub fn offset(&self) -> i64
    {
        match self {
            FrameRule::Offset(offset) | FrameRule::ValOffset(offset) | FrameRule::Cfa { offset, .. } => *offset,
            _ => 0,
        }
    }
}

/// Complete unwind rule set in effect at one program counter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameContext
{
    /// Rule computing the canonical frame address
    pub cfa: FrameRule,
    /// Rules for every register that has one, keyed by DWARF number
    pub regs: BTreeMap<u16, FrameRule>,
    /// Register whose recovered value is the return address
    pub ret_addr_reg: u16,
}

impl FrameContext
{
    pub fn new(cfa: FrameRule, ret_addr_reg: u16) -> Self
    {
        Self {
            cfa,
            regs: BTreeMap::new(),
            ret_addr_reg,
        }
    }

    /// Builder-style rule insertion.
    #[must_use]
    pub fn with_rule(mut self, register: u16, rule: FrameRule) -> Self
    {
        self.regs.insert(register, rule);
        self
    }

    /// Rule for `register`, `Undefined` when there is none.
    pub fn rule(&self, register: u16) -> &FrameRule
    {
        self.regs.get(&register).unwrap_or(&FrameRule::Undefined)
    }
}

/// Source of call frame information
///
/// Implementations answer with the rules in effect at `pc`, or with
/// [`QuarryError::NoFrameDescription`] when no entry covers it. The latter is
/// not fatal: the unwinder falls back to the architecture's default rules.
pub trait FrameDescriptionLookup: Send + Sync
{
    fn frame_context(&self, pc: u64) -> QuarryResult<FrameContext>;
}

/// In-memory frame descriptions, one rule set per address range
///
/// Useful for generated code and for describing frames that never had CFI.
/// Ranges are half-open and must not overlap; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct FrameTable
{
    entries: Vec<(Range<u64>, FrameContext)>,
}

impl FrameTable
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Describe `[begin, end)`.
    pub fn add(&mut self, begin: u64, end: u64, context: FrameContext)
    {
        let index = self.entries.partition_point(|(range, _)| range.start < begin);
        self.entries.insert(index, (begin..end, context));
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

impl FrameDescriptionLookup for FrameTable
{
    fn frame_context(&self, pc: u64) -> QuarryResult<FrameContext>
    {
        let index = self.entries.partition_point(|(range, _)| range.start <= pc);
        index
            .checked_sub(1)
            .and_then(|index| self.entries.get(index))
            .filter(|(range, _)| range.contains(&pc))
            .map(|(_, context)| context.clone())
            .ok_or(QuarryError::NoFrameDescription(pc))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn context(offset: i64) -> FrameContext
    {
        FrameContext::new(FrameRule::Cfa { register: 7, offset }, 16).with_rule(16, FrameRule::Offset(-8))
    }

    #[test]
    fn test_lookup_finds_covering_range()
    {
        let mut table = FrameTable::new();
        table.add(0x2000, 0x2100, context(16));
        table.add(0x1000, 0x1100, context(8));

        assert_eq!(table.frame_context(0x1000).unwrap().cfa.offset(), 8);
        assert_eq!(table.frame_context(0x20ff).unwrap().cfa.offset(), 16);
    }

    #[test]
    fn test_gaps_report_missing_description()
    {
        let mut table = FrameTable::new();
        table.add(0x1000, 0x1100, context(8));

        let err = table.frame_context(0x1100).unwrap_err();
        assert!(err.is_missing_frame_description());
        assert!(table.frame_context(0x0fff).unwrap_err().is_missing_frame_description());
    }

    #[test]
    fn test_rule_defaults_to_undefined()
    {
        let ctx = context(8);
        assert_eq!(ctx.rule(16), &FrameRule::Offset(-8));
        assert_eq!(ctx.rule(6), &FrameRule::Undefined);
    }
}

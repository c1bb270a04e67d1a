//! Stack frames.

use crate::error::QuarryError;
use crate::types::{Architecture, DwarfRegisters, Location};

/// One frame of a stack trace
///
/// A frame has two locations. `current` is where execution is in the frame:
/// the program counter for the innermost frame, the return address for the
/// others. `call` is the call instruction that left the frame; its `pc` is
/// the same as `current.pc` but its file, line and function come from the
/// byte before the return address.
///
/// Frames synthesized for inlined calls share registers and `current` with
/// their physical frame. Their `call` names the inlined function.
#[derive(Debug, Clone)]
pub struct Stackframe
{
    pub current: Location,
    pub call: Location,
    /// Registers of this frame; `cfa` and `frame_base` are filled in
    pub regs: DwarfRegisters,
    pub(crate) stack_hi: u64,
    /// Return address, as read from the frame
    pub ret: u64,
    /// Address the return address was read from
    pub(crate) addr_ret: u64,
    /// Set on the trailing frame of a walk that stopped on an error
    pub err: Option<QuarryError>,
    /// The frame is on a system stack rather than a goroutine stack
    pub system_stack: bool,
    pub inlined: bool,
    pub(crate) last_pc: u64,
}

impl Stackframe
{
    pub(crate) fn empty(architecture: Architecture) -> Self
    {
        Self {
            current: Location::default(),
            call: Location::default(),
            regs: DwarfRegisters::new(architecture),
            stack_hi: 0,
            ret: 0,
            addr_ret: 0,
            err: None,
            system_stack: false,
            inlined: false,
            last_pc: 0,
        }
    }

    /// The frame appended after the last good frame when a walk fails.
    pub fn sentinel(err: QuarryError, architecture: Architecture) -> Self
    {
        Self {
            err: Some(err),
            ..Self::empty(architecture)
        }
    }

    /// Address of the frame: absolute on a system stack, otherwise relative
    /// to the high end of the goroutine stack (so negative).
    pub fn frame_offset(&self) -> i64
    {
        if self.system_stack {
            return self.regs.cfa;
        }
        self.regs.cfa.wrapping_sub(self.stack_hi as i64)
    }

    /// The frame pointer, absolute or relative like [`Stackframe::frame_offset`].
    pub fn frame_pointer_offset(&self) -> i64
    {
        if self.system_stack {
            return self.regs.bp() as i64;
        }
        (self.regs.bp() as i64).wrapping_sub(self.stack_hi as i64)
    }

    /// An address inside the last instruction executed in this frame.
    ///
    /// The program counter for the innermost frame, usually one byte before
    /// the return address for the others. Lexical scopes are resolved with
    /// it; it is not necessarily the start of an instruction.
    pub fn last_pc(&self) -> u64
    {
        self.last_pc
    }

    /// Address the return address was read from.
    pub fn return_address_slot(&self) -> u64
    {
        self.addr_ret
    }

    /// High end of the stack this frame is on, zero when unknown.
    pub fn stack_hi(&self) -> u64
    {
        self.stack_hi
    }
}

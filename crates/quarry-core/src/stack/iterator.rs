//! The frame-by-frame unwinder.

use std::sync::Arc;

use tracing::{debug, trace};

use super::frame::Stackframe;
use super::task::{SavedLr, TaskContext};
use crate::binary::{BinaryInfo, Function, InlineLookup};
use crate::error::{QuarryError, QuarryResult};
use crate::frame::{execute_frame_expression, execute_stack_program, FrameRule};
use crate::memory::{read_int, read_uint, Memory};
use crate::types::{Address, DwarfRegisters};

/// Offset from the system stack pointer where `runtime.asmcgocall` saves
/// the goroutine's stack pointer, as a distance from the stack's high end.
const ASMCGOCALL_SP_OFFSET_SAVE_SLOT: u64 = 0x28;

const STACK_BARRIER: &str = "runtime.stackBarrier";

/// Where a goroutine resumes when it is switched back to
#[derive(Debug, Clone, Copy)]
struct ResumePoint
{
    pc: u64,
    sp: u64,
    bp: u64,
}

/// Walks a stack one physical frame at a time
///
/// Each step computes the caller's registers from the current frame's
/// unwind rules, and follows the runtime's switches between goroutine
/// stacks and system stacks. A cursor must not be driven from two places
/// at once; clone the registers and start another one instead.
pub struct StackIterator
{
    pc: u64,
    top: bool,
    at_end: bool,
    frame: Stackframe,
    bi: Arc<BinaryInfo>,
    mem: Memory,
    err: Option<QuarryError>,

    stack_hi: u64,
    system_stack: bool,
    stack_barrier_pc: u64,
    saved_lrs: Vec<SavedLr>,

    regs: DwarfRegisters,

    resume: Option<ResumePoint>,
    g0_sched_sp: u64,
}

impl StackIterator
{
    /// Start a walk at `regs`.
    ///
    /// With a `task` the walk knows the goroutine's stack bounds, whether it
    /// starts on a system stack, the scheduler stack pointer of the thread's
    /// `g0` and the saved return addresses of stack barriers. Without one it
    /// starts on a system stack and never switches to a goroutine stack at
    /// runtime frames.
    pub fn new(bi: Arc<BinaryInfo>, mem: Memory, regs: DwarfRegisters, task: Option<&TaskContext>) -> Self
    {
        let mut it = Self {
            pc: regs.pc(),
            top: true,
            at_end: false,
            frame: Stackframe::empty(bi.architecture()),
            bi,
            mem,
            err: None,
            stack_hi: 0,
            system_stack: true,
            stack_barrier_pc: 0,
            saved_lrs: Vec::new(),
            regs,
            resume: None,
            g0_sched_sp: 0,
        };
        let Some(task) = task else {
            return it;
        };

        it.stack_hi = task.stack_hi;
        it.system_stack = task.system_stack;
        it.g0_sched_sp = task.g0_sched_sp;
        it.resume = Some(ResumePoint {
            pc: task.pc,
            sp: task.sp,
            bp: task.bp,
        });

        let saved = task.saved_lrs();
        let barrier = it.bi.lookup_func(STACK_BARRIER).map(|function| function.entry);
        if let (Some(barrier), false) = (barrier, saved.is_empty()) {
            it.stack_barrier_pc = barrier;
            let mut pos = task.saved_lr_pos();
            let in_barrier = it
                .bi
                .pc_to_func(it.regs.pc())
                .is_some_and(|function| function.name == STACK_BARRIER);
            if in_barrier {
                // The barrier may or may not have advanced the position yet
                let sp = it.regs.sp();
                let below = |pos: usize| saved.get(pos).is_some_and(|lr| lr.ptr < sp);
                if !below(pos) {
                    if pos > 0 && below(pos - 1) {
                        pos -= 1;
                    } else {
                        it.err = Some(QuarryError::StackBarrier(sp));
                        return it;
                    }
                }
            }
            it.saved_lrs = saved.get(pos..).unwrap_or_default().to_vec();
        }
        it
    }

    /// Move to the next frame. Returns false at the end of the stack or on
    /// an error; see [`StackIterator::err`].
    pub fn next(&mut self) -> bool
    {
        if self.err.is_some() || self.at_end {
            return false;
        }
        let Some((call_regs, ret, ret_addr)) = self.advance_regs() else {
            return false;
        };
        let Some(frame) = self.new_stackframe(ret, ret_addr) else {
            return false;
        };
        self.frame = frame;

        if self.stack_barrier_pc != 0 {
            if let Some(lr) = self.saved_lrs.first().copied() {
                if self.frame.ret == self.stack_barrier_pc && self.frame.addr_ret == lr.ptr {
                    trace!(slot = lr.ptr, "skipping stack barrier frame");
                    self.frame.ret = lr.val;
                    self.saved_lrs.remove(0);
                }
            }
        }

        if self.switch_stack() {
            return true;
        }

        if self.frame.ret == 0 {
            debug!(pc = %Address::new(self.pc), "reached the end of the stack");
            self.at_end = true;
            return true;
        }

        self.top = false;
        self.pc = self.frame.ret;
        self.regs = call_regs;
        true
    }

    /// The frame the iterator is on.
    pub fn frame(&self) -> &Stackframe
    {
        &self.frame
    }

    /// The error that ended the walk, if any.
    pub fn err(&self) -> Option<&QuarryError>
    {
        self.err.as_ref()
    }

    /// Collect up to `depth + 1` frames, counting synthesized inlined
    /// frames.
    ///
    /// If the walk fails after at least one frame, the frames are returned
    /// followed by one sentinel frame carrying the error.
    pub fn stacktrace(&mut self, depth: i64) -> QuarryResult<Vec<Stackframe>>
    {
        if depth < 0 {
            return Err(QuarryError::NegativeDepth);
        }
        let limit = usize::try_from(depth).unwrap_or(usize::MAX).saturating_add(1);
        let mut frames = Vec::with_capacity(limit.min(64));
        while self.next() {
            let frame = self.frame.clone();
            self.append_inline_calls(&mut frames, frame);
            if frames.len() >= limit {
                break;
            }
        }
        if let Some(err) = self.err.clone() {
            if frames.is_empty() {
                return Err(err);
            }
            frames.push(Stackframe::sentinel(err, self.bi.architecture()));
        }
        Ok(frames)
    }

    /// Keep the first error; later ones are consequences of it.
    fn fail(&mut self, err: QuarryError)
    {
        if self.err.is_none() {
            debug!(pc = %Address::new(self.pc), %err, "stack walk stopped");
            self.err = Some(err);
        }
    }

    fn ptr_size(&self) -> usize
    {
        usize::from(self.bi.architecture().pointer_size())
    }

    /// Switch between the system stack and a goroutine stack when the
    /// current frame belongs to a function that does so. Returns true when
    /// the cursor has already been moved, or the walk is over.
    fn switch_stack(&mut self) -> bool
    {
        let Some(name) = self.frame.current.function_name().map(str::to_owned) else {
            return false;
        };
        match name.as_str() {
            "runtime.asmcgocall" => {
                if self.top || !self.system_stack {
                    return false;
                }
                // Going from callee to caller this is system stack -> goroutine stack
                let slot = Address::new(self.regs.sp().wrapping_add(ASMCGOCALL_SP_OFFSET_SAVE_SLOT));
                let Ok(offset) = read_int(self.mem.as_ref(), slot, self.ptr_size()) else {
                    return false;
                };
                let old_sp = self.regs.sp();
                let new_sp = self.stack_hi.wrapping_add_signed(offset.wrapping_neg());
                // Called from the system stack: no switch happened
                if new_sp == old_sp {
                    return false;
                }
                self.regs.set_sp(new_sp);
                self.system_stack = false;
                debug!(from = %Address::new(old_sp), to = %Address::new(new_sp), "switched to goroutine stack");

                self.frame.addr_ret = new_sp.wrapping_add(self.ptr_size() as u64);
                self.frame.ret = match read_uint(self.mem.as_ref(), Address::new(self.frame.addr_ret), self.ptr_size()) {
                    Ok(ret) => ret,
                    Err(err) => {
                        self.fail(err);
                        0
                    }
                };
                self.pc = self.frame.ret;
                self.top = false;
                true
            }
            "runtime.cgocallback_gofunc" => {
                if self.top || self.system_stack || self.g0_sched_sp == 0 {
                    return false;
                }
                // Going from callee to caller this is goroutine stack -> system stack
                self.regs.set_sp(self.g0_sched_sp);
                debug!(to = %Address::new(self.g0_sched_sp), "switched to system stack");
                // The callback saved the previous g0.sched.sp at the new stack pointer
                self.g0_sched_sp = read_uint(self.mem.as_ref(), Address::new(self.regs.sp()), self.ptr_size()).unwrap_or(0);
                self.top = false;
                let Some((call_regs, ret, ret_addr)) = self.advance_regs() else {
                    return true;
                };
                let Some(on_system_stack) = self.new_stackframe(ret, ret_addr) else {
                    return true;
                };
                self.pc = on_system_stack.ret;
                self.regs = call_regs;
                self.system_stack = true;
                true
            }
            "runtime.goexit" | "runtime.rt0_go" | "runtime.mcall" => {
                debug!(function = %name, "reached the top of the stack");
                self.at_end = true;
                true
            }
            _ => {
                let Some(resume) = self.resume else {
                    return false;
                };
                if !(self.system_stack && self.top && name.starts_with("runtime.")) {
                    return false;
                }
                // Runtime code on the system stack: continue from where the
                // goroutine was switched out
                debug!(function = %name, pc = %Address::new(resume.pc), "jumping to goroutine stack");
                self.system_stack = false;
                self.top = false;
                self.pc = resume.pc;
                self.regs.set_sp(resume.sp);
                self.regs.set_bp(resume.bp);
                true
            }
        }
    }

    /// Frame base of `function` at the current registers, zero when it
    /// cannot be evaluated.
    fn frame_base(&self, function: &Function) -> i64
    {
        let Some(expression) = &function.frame_base else {
            return 0;
        };
        execute_stack_program(&self.regs, expression, Some(self.mem.as_ref())).map_or(0, |(base, _)| base)
    }

    fn new_stackframe(&mut self, ret: u64, ret_addr: u64) -> Option<Stackframe>
    {
        if ret_addr == 0 {
            self.fail(QuarryError::NullAddress);
            return None;
        }
        let current = self.bi.pc_to_line(self.pc);
        if let Some(function) = &current.function {
            self.regs.frame_base = self.frame_base(function);
        }

        let mut frame = Stackframe {
            call: current.clone(),
            current,
            regs: self.regs.clone(),
            stack_hi: self.stack_hi,
            ret,
            addr_ret: ret_addr,
            err: None,
            system_stack: self.system_stack,
            inlined: false,
            last_pc: self.pc,
        };
        if !self.top {
            match frame.current.function_name() {
                // Inserted by runtime.systemstack; there is no call instruction before them
                Some("runtime.mstart" | "runtime.systemstack_switch") => {}
                _ => {
                    frame.last_pc = self.pc.saturating_sub(1);
                    frame.call = self.bi.pc_to_line(frame.last_pc);
                    frame.call.pc = frame.current.pc;
                }
            }
        }
        Some(frame)
    }

    /// Append `frame`, preceded by one frame per call inlined at its call
    /// site, innermost first.
    fn append_inline_calls(&self, frames: &mut Vec<Stackframe>, mut frame: Stackframe)
    {
        let Some(function) = frame.call.function.clone() else {
            frames.push(frame);
            return;
        };
        let mut call_pc = frame.call.pc.value();
        if !frames.is_empty() {
            call_pc = call_pc.saturating_sub(1);
        }

        for record in self.bi.inlined_calls(&function, call_pc) {
            let mut inlined = frame.clone();
            inlined.call.function = Some(record.function);
            inlined.inlined = true;
            frames.push(inlined);

            frame.call.file = record.call_file;
            frame.call.line = Some(record.call_line);
        }
        frames.push(frame);
    }

    /// Compute the CFA of the current frame and the registers of its
    /// caller, with the return address and the slot it was read from.
    fn advance_regs(&mut self) -> Option<(DwarfRegisters, u64, u64)>
    {
        let architecture = self.bi.architecture();
        let found = match self.bi.frame_context(self.pc) {
            Ok(context) => Some(context),
            Err(err) if err.is_missing_frame_description() => {
                trace!(pc = %Address::new(self.pc), "no frame description, using frame pointer rules");
                None
            }
            Err(err) => {
                self.fail(err);
                return None;
            }
        };
        let context = architecture.fix_frame_unwind_context(found, self.pc, &self.bi);

        let cfa = match self.execute_frame_reg_rule(0, &context.cfa, 0) {
            Ok(Some(cfa)) => cfa as i64,
            _ => {
                self.fail(QuarryError::UndefinedCfa(self.pc));
                return None;
            }
        };
        self.regs.cfa = cfa;

        let mut call_regs = DwarfRegisters::new(architecture);
        // The stack pointer of the caller is the CFA unless a rule says otherwise
        call_regs.add_reg(architecture.sp_register(), cfa as u64);

        let mut ret = 0;
        let mut ret_addr = 0;
        for (&number, rule) in &context.regs {
            let value = self.execute_frame_reg_rule(number, rule, cfa);
            call_regs.set_reg(number, value.as_ref().ok().copied().flatten());
            if number == context.ret_addr_reg {
                match value {
                    Ok(Some(value)) => ret = value,
                    Ok(None) => self.fail(QuarryError::UndefinedReturnAddress(self.pc)),
                    Err(err) => self.fail(err),
                }
                ret_addr = cfa.wrapping_add(rule.offset()) as u64;
            }
        }
        Some((call_regs, ret, ret_addr))
    }

    /// Value of register `number` in the caller. `Ok(None)` means the
    /// register is undefined there.
    fn execute_frame_reg_rule(&self, number: u16, rule: &FrameRule, cfa: i64) -> QuarryResult<Option<u64>>
    {
        match rule {
            FrameRule::Undefined => Ok(None),
            FrameRule::SameValue => Ok(self.regs.reg(number)),
            FrameRule::Offset(offset) => self.read_register_at(cfa.wrapping_add(*offset) as u64).map(Some),
            FrameRule::ValOffset(offset) => Ok(Some(cfa.wrapping_add(*offset) as u64)),
            FrameRule::Register(register) => Ok(self.regs.reg(*register)),
            FrameRule::Expression(expression) => {
                let address = execute_frame_expression(&self.regs, expression, cfa, Some(self.mem.as_ref()))?;
                self.read_register_at(address as u64).map(Some)
            }
            FrameRule::ValExpression(expression) => {
                execute_frame_expression(&self.regs, expression, cfa, Some(self.mem.as_ref())).map(|value| Some(value as u64))
            }
            FrameRule::Architectural => Err(QuarryError::Unsupported("architectural frame rules".into())),
            FrameRule::Cfa { register, offset } => {
                Ok(self.regs.reg(*register).map(|value| value.wrapping_add_signed(*offset)))
            }
            FrameRule::FramePointer(register) => match self.regs.reg(*register) {
                None => Ok(None),
                Some(value) if value <= cfa as u64 => self.read_register_at(value).map(Some),
                Some(value) => Ok(Some(value)),
            },
        }
    }

    fn read_register_at(&self, address: u64) -> QuarryResult<u64>
    {
        read_uint(self.mem.as_ref(), Address::new(address), self.ptr_size())
    }
}

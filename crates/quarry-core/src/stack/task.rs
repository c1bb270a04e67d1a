//! Goroutine contexts.

use std::fmt;
use std::sync::Arc;

use super::frame::Stackframe;
use super::iterator::StackIterator;
use crate::binary::{BinaryInfo, TypeKind};
use crate::error::{QuarryError, QuarryResult};
use crate::eval::{LoadConfig, Value, Variable};
use crate::memory::Memory;
use crate::types::{Address, DwarfRegisters, Location};

/// A return address the runtime replaced with a stack barrier, and the
/// slot it was replaced in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedLr
{
    pub ptr: u64,
    pub val: u64,
}

/// A goroutine, reconstructed from the runtime's `g` structure
///
/// A parked goroutine is described entirely by its saved scheduler
/// registers. One that is running on a thread is attached to it with
/// [`TaskContext::on_thread`]; its walk then starts from the thread's
/// registers.
#[derive(Clone)]
pub struct TaskContext
{
    pub id: i64,
    /// Saved program counter, stack pointer and frame pointer
    pub pc: u64,
    pub sp: u64,
    pub bp: u64,
    /// Program counter of the `go` statement that created the goroutine
    pub gopc: u64,
    pub status: u64,
    pub wait_reason: String,
    pub stack_lo: u64,
    pub stack_hi: u64,
    /// The goroutine is running runtime code on its thread's system stack
    pub system_stack: bool,
    /// Where the goroutine was parked
    pub current_loc: Location,

    pub(crate) g0_sched_sp: u64,
    saved_lrs: Vec<SavedLr>,
    saved_lr_pos: usize,
    thread_regs: Option<DwarfRegisters>,

    bi: Arc<BinaryInfo>,
    mem: Memory,
}

impl TaskContext
{
    /// Read a goroutine from a `runtime.g` value, or a pointer to one.
    pub fn parse(g: &Variable) -> QuarryResult<Self>
    {
        let mut g = g.clone();
        while let Some(TypeKind::Pointer(_)) = g.real().map(|real| real.kind.clone()) {
            let target = g.maybe_dereference();
            if let Some(err) = &target.unreadable {
                return Err(err.clone());
            }
            if target.addr.is_null() {
                return Err(QuarryError::Nil(format!("goroutine pointer {}", g.name)));
            }
            g = target;
        }

        g.load_value(&LoadConfig {
            follow_pointers: false,
            max_variable_recurse: 2,
            max_string_len: 64,
            max_array_values: 0,
            max_struct_fields: -1,
        });
        if let Some(err) = &g.unreadable {
            return Err(err.clone());
        }

        let int = |v: Option<&Variable>| v.and_then(|v| v.value.as_ref()).and_then(Value::as_i64).unwrap_or(0);
        let sched = g
            .field_variable("sched")
            .ok_or_else(|| QuarryError::MalformedType("goroutine without scheduler registers".into()))?;
        let pc = int(sched.field_variable("pc")) as u64;
        let sp = int(sched.field_variable("sp")) as u64;
        // Older runtimes do not save the frame pointer
        let bp = int(sched.field_variable("bp")) as u64;

        let stack = g.field_variable("stack");
        let stack_lo = int(stack.and_then(|stack| stack.field_variable("lo"))) as u64;
        let stack_hi = int(stack.and_then(|stack| stack.field_variable("hi"))) as u64;

        let wait_reason = g
            .field_variable("waitreason")
            .and_then(|reason| reason.value.as_ref())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (saved_lrs, saved_lr_pos) = saved_return_addresses(&g)?;
        let g0_sched_sp = g
            .field_variable("m")
            .and_then(|m| g0_sched_sp(m).ok())
            .unwrap_or(0);

        let bi = Arc::clone(g.binary_info());
        Ok(Self {
            id: int(g.field_variable("goid")),
            pc,
            sp,
            bp,
            gopc: int(g.field_variable("gopc")) as u64,
            status: int(g.field_variable("atomicstatus")) as u64,
            wait_reason,
            stack_lo,
            stack_hi,
            system_stack: false,
            current_loc: bi.pc_to_line(pc),
            g0_sched_sp,
            saved_lrs,
            saved_lr_pos,
            thread_regs: None,
            mem: Arc::clone(g.memory()),
            bi,
        })
    }

    /// Attach the goroutine to the thread running it.
    ///
    /// A stack pointer outside the goroutine's own stack means the thread
    /// is on its system stack.
    #[must_use]
    pub fn on_thread(mut self, regs: DwarfRegisters) -> Self
    {
        let sp = regs.sp();
        self.system_stack = self.stack_hi != 0 && !(self.stack_lo..self.stack_hi).contains(&sp);
        self.thread_regs = Some(regs);
        self
    }

    /// Registers of the saved scheduler context.
    pub fn dwarf_registers(&self) -> DwarfRegisters
    {
        DwarfRegisters::with_frame(self.bi.architecture(), self.pc, self.sp, self.bp)
    }

    /// Stack barrier records still pending.
    pub fn saved_lrs(&self) -> &[SavedLr]
    {
        &self.saved_lrs
    }

    pub(crate) fn saved_lr_pos(&self) -> usize
    {
        self.saved_lr_pos
    }

    pub(crate) fn binary_info(&self) -> &Arc<BinaryInfo>
    {
        &self.bi
    }

    pub(crate) fn memory(&self) -> &Memory
    {
        &self.mem
    }

    pub fn stack_iterator(&self) -> StackIterator
    {
        let regs = self.thread_regs.clone().unwrap_or_else(|| self.dwarf_registers());
        StackIterator::new(Arc::clone(&self.bi), Arc::clone(&self.mem), regs, Some(self))
    }

    pub fn stacktrace(&self, depth: i64) -> QuarryResult<Vec<Stackframe>>
    {
        self.stack_iterator().stacktrace(depth)
    }

    /// Where user code is, or was before it called into the runtime: the
    /// call site of the first frame in a non-runtime function. Exported
    /// runtime functions count as user code.
    pub fn user_current(&self) -> Location
    {
        let mut it = self.stack_iterator();
        while it.next() {
            let call = &it.frame().call;
            if let Some(name) = call.function_name() {
                if name.contains('.') && (!name.starts_with("runtime.") || is_exported_runtime(name)) {
                    return call.clone();
                }
            }
        }
        self.current_loc.clone()
    }

    /// The `go` statement that started the goroutine.
    ///
    /// The reported `pc` is the return address of the call; file, line and
    /// function are those of the call instruction before it.
    pub fn go_location(&self) -> Location
    {
        let mut pc = self.gopc;
        if self.bi.pc_to_func(pc).is_some_and(|function| pc > function.entry) {
            pc -= 1;
        }
        Location {
            pc: Address::new(self.gopc),
            ..self.bi.pc_to_line(pc)
        }
    }
}

impl fmt::Debug for TaskContext
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("pc", &Address::new(self.pc))
            .field("sp", &Address::new(self.sp))
            .field("stack_hi", &Address::new(self.stack_hi))
            .field("system_stack", &self.system_stack)
            .field("current_loc", &self.current_loc)
            .finish_non_exhaustive()
    }
}

/// `runtime.Foo`, as opposed to `runtime.foo`.
fn is_exported_runtime(name: &str) -> bool
{
    name.strip_prefix("runtime.")
        .and_then(|rest| rest.bytes().next())
        .is_some_and(|first| first.is_ascii_uppercase())
}

/// Saved stack pointer of the scheduler goroutine of the thread `m`.
fn g0_sched_sp(m: &Variable) -> QuarryResult<u64>
{
    m.struct_member("g0")?.struct_member("sched")?.struct_member("sp")?.as_uint()
}

/// The `stkbar` records and `stkbarPos` of runtimes that still have stack
/// barriers; empty otherwise.
fn saved_return_addresses(g: &Variable) -> QuarryResult<(Vec<SavedLr>, usize)>
{
    let Ok(mut stkbar) = g.struct_member("stkbar") else {
        return Ok((Vec::new(), 0));
    };
    let pos = g
        .field_variable("stkbarPos")
        .and_then(|pos| pos.value.as_ref())
        .and_then(Value::as_i64)
        .unwrap_or(0);

    stkbar.load_value(&LoadConfig {
        follow_pointers: false,
        max_variable_recurse: 1,
        max_string_len: 0,
        max_array_values: usize::try_from(stkbar.len).unwrap_or(0),
        max_struct_fields: 3,
    });
    if let Some(err) = &stkbar.unreadable {
        return Err(QuarryError::unreadable("stkbar", err));
    }

    let field = |record: &Variable, name: &str| {
        record
            .field_variable(name)
            .and_then(|field| field.value.as_ref())
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let records = stkbar
        .children
        .iter()
        .map(|record| SavedLr {
            ptr: field(record, "savedLRPtr"),
            val: field(record, "savedLRVal"),
        })
        .collect();
    Ok((records, usize::try_from(pos).unwrap_or(0)))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_exported_runtime_names()
    {
        assert!(is_exported_runtime("runtime.Gosched"));
        assert!(!is_exported_runtime("runtime.gopark"));
        assert!(!is_exported_runtime("runtime."));
        assert!(!is_exported_runtime("main.main"));
    }
}

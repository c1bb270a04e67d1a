//! # Stack Unwinding
//!
//! Reconstructs the chain of calls that led to a program counter.
//!
//! ## Overview
//!
//! - [`StackIterator`]: steps from a frame to its caller using the frame
//!   descriptions of the binary, or frame pointer rules where there are none
//! - [`Stackframe`]: one step, with the caller's call site and the registers
//!   local variables are read from
//! - [`TaskContext`]: a goroutine read from the runtime's `g` structure; its
//!   stack may be interleaved with the thread's system stack when it calls
//!   into C or the runtime
//!
//! Calls the compiler inlined have no frame of their own. Stack traces
//! synthesize one per inlined call, sharing the registers of the physical
//! frame that contains them.
//!
//! ## Termination
//!
//! A walk ends at a zero return address, at one of the functions that start
//! a thread or goroutine (`runtime.goexit`, `runtime.rt0_go`,
//! `runtime.mcall`), or on the first error. Errors after the first frame do
//! not discard what was collected: the trace ends with a sentinel frame
//! whose `err` is set.

mod frame;
mod iterator;
mod task;

use std::sync::Arc;

pub use frame::Stackframe;
pub use iterator::StackIterator;
pub use task::{SavedLr, TaskContext};

use crate::binary::BinaryInfo;
use crate::error::QuarryResult;
use crate::memory::Memory;
use crate::types::DwarfRegisters;

/// Stack trace of a thread stopped at `regs`.
///
/// When the thread is running a goroutine, pass its context: the walk then
/// knows the goroutine's stack and can cross from the system stack back to
/// it.
pub fn thread_stacktrace(
    bi: Arc<BinaryInfo>,
    mem: Memory,
    regs: DwarfRegisters,
    task: Option<&TaskContext>,
    depth: i64,
) -> QuarryResult<Vec<Stackframe>>
{
    match task {
        Some(task) => task.clone().on_thread(regs).stacktrace(depth),
        None => StackIterator::new(bi, mem, regs, None).stacktrace(depth),
    }
}

/// Stack trace of a goroutine, from the thread running it if it is
/// attached to one, otherwise from where it was parked.
pub fn task_stacktrace(task: &TaskContext, depth: i64) -> QuarryResult<Vec<Stackframe>>
{
    task.stacktrace(depth)
}

//! # quarry-core
//!
//! The parts of a debugger that read a stopped program: where it is, how it
//! got there, and what its variables hold.
//!
//! This crate provides:
//! - Line tables: addresses to source positions and back ([`line`])
//! - Call frame information and DWARF location expressions ([`frame`])
//! - Stack unwinding, including inlined calls and goroutine stacks ([`stack`])
//! - Typed values reconstructed from raw memory ([`eval`])
//!
//! ## Collaborators
//!
//! Nothing in this crate controls a process. Memory comes through a
//! [`memory::MemoryReadWriter`] and registers as a [`types::DwarfRegisters`]
//! snapshot; both are supplied by whatever attached to the program. Debug
//! information is read once into a [`binary::BinaryInfo`], either from an
//! executable with [`binary::BinaryInfo::load`] or assembled with
//! [`binary::BinaryInfoBuilder`].
//!
//! ## Errors
//!
//! Every fallible operation returns [`QuarryResult`]. Failures to read a
//! single value or frame are kept with the value or frame rather than
//! aborting the surrounding walk; see [`error`].

pub mod binary;
pub mod error;
pub mod eval;
pub mod frame;
pub mod line;
pub mod memory;
pub mod stack;
pub mod types;

/// Reader the DWARF sections are parsed with: owned, shared bytes so parsed
/// line programs and frame tables can outlive the object file.
pub type OwnedReader = gimli::EndianArcSlice<gimli::RunTimeEndian>;

// Re-export commonly used types
pub use binary::BinaryInfo;
pub use error::{QuarryError, QuarryResult};
pub use eval::{EvalScope, LoadConfig, Variable};
pub use memory::{Memory, MemoryReadWriter};
pub use stack::{Stackframe, StackIterator, TaskContext};
pub use types::{Address, Architecture, DwarfRegisters, Location};

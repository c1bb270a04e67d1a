//! # Types
//!
//! Platform-agnostic types shared by the line table, the unwinder and the
//! value engine.
//!
//! Nothing here talks to a live process. Register snapshots and addresses come
//! from the process-control layer; everything downstream works on these plain
//! values.

pub mod address;
pub mod arch;
pub mod dwarf_registers;
pub mod location;
pub mod registers;

// Re-export all public types
pub use address::Address;
pub use arch::Architecture;
pub use dwarf_registers::DwarfRegisters;
pub use location::{Location, UNKNOWN_FILE};
pub use registers::{Registers, X86_64Register};

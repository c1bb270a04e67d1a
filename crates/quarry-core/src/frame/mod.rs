//! # Call Frame Information
//!
//! Register recovery rules for unwinding, and the DWARF expression evaluator
//! shared by unwinding and variable location.
//!
//! ## Overview
//!
//! - [`FrameDescriptionLookup`]: the rules in effect at a program counter
//! - [`FrameTable`]: rules described in memory, per address range
//! - [`CfiTable`]: rules decoded from `.eh_frame` or `.debug_frame`
//! - [`Architecture::fix_frame_unwind_context`](crate::types::Architecture::fix_frame_unwind_context):
//!   frame pointer defaults for code without CFI
//! - [`execute_stack_program`]: location expressions
//!
//! ## References
//!
//! - [DWARF 5, section 6.4: Call Frame Information](https://dwarfstd.org/doc/DWARF5.pdf)
//! - [gimli crate documentation](https://docs.rs/gimli/latest/gimli/)

mod arch;
mod cfi;
mod expr;
mod rules;

pub(crate) use expr::execute_frame_expression;
pub use cfi::{CfiSectionKind, CfiTable};
pub use expr::{execute_stack_program, Piece, PieceLocation};
pub use rules::{FrameContext, FrameDescriptionLookup, FrameRule, FrameTable};

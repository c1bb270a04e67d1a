//! # Line Tables
//!
//! Maps instruction addresses to source positions and back by interpreting
//! DWARF line number programs.
//!
//! ## Overview
//!
//! A line number program is a compact bytecode. Running it produces rows of
//! `(address, file, line)`; [`StateMachine`] executes it one opcode at a time
//! and [`LineTable`] answers the usual queries on top:
//!
//! - [`LineTable::pc_to_line`]: the row at an address, or the closest one
//!   before it
//! - [`LineTable::line_to_pc`]: the first address of a source line
//! - [`LineTable::all_pcs_for_file_line`]: every entry into a source line
//! - [`LineTable::all_pcs_between`]: the row addresses inside a range
//!
//! Lookups that miss are not errors; plenty of runtime code has no line
//! information at all.
//!
//! ## Caching
//!
//! Machines clone cheaply (the instruction bytes are shared, the read cursor
//! is not), so a table parks one machine at each function entry it is asked
//! about and forks it for later lookups in the same function.

mod header;
mod state_machine;
mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use header::{FileEntry, LineProgramHeader};
pub use state_machine::StateMachine;
pub use table::LineTable;

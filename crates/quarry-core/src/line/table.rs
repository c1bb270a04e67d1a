//! Address and line queries over one compilation unit's line program.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use gimli::{Reader, RunTimeEndian};
use tracing::{trace, warn};

use super::header::LineProgramHeader;
use super::state_machine::StateMachine;
use crate::error::{QuarryError, QuarryResult};
use crate::OwnedReader;

/// The line table of one compilation unit
///
/// Every query interprets the program from scratch except
/// [`LineTable::pc_to_line`] with a base address, which is served from a
/// two-level cache keyed by function entry:
///
/// - a *canonical* machine parked at the entry row, never advanced again
/// - a *last used* machine forked from it and left wherever the previous
///   lookup stopped
///
/// A lookup that lies ahead of the last used machine continues it; one that
/// lies behind forks the canonical machine again. The caches live behind
/// mutexes so a table can be shared across threads, but each machine is only
/// ever driven by the caller holding it.
pub struct LineTable
{
    header: Arc<LineProgramHeader>,
    instructions: OwnedReader,
    canonical: Mutex<HashMap<u64, StateMachine>>,
    last_used: Mutex<HashMap<u64, StateMachine>>,
}

impl std::fmt::Debug for LineTable
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("LineTable")
            .field("files", &self.header.file_names.len())
            .field("program_len", &self.instructions.len())
            .finish_non_exhaustive()
    }
}

impl LineTable
{
    /// Create a table from a decoded header and the raw opcode bytes that
    /// follow it.
    pub fn new(header: LineProgramHeader, program: impl Into<Arc<[u8]>>) -> Self
    {
        let instructions = OwnedReader::new(program.into(), header.endian);
        Self {
            header: Arc::new(header),
            instructions,
            canonical: Mutex::new(HashMap::new()),
            last_used: Mutex::new(HashMap::new()),
        }
    }

    /// Create a table from a line program header parsed by gimli.
    pub fn from_header<R>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        header: &gimli::LineProgramHeader<R>,
        endian: RunTimeEndian,
    ) -> QuarryResult<Self>
    where
        R: Reader,
    {
        let program = header
            .raw_program_buf()
            .to_slice()
            .map_err(|err| QuarryError::dwarf("reading line program", err))?
            .into_owned();
        let decoded = LineProgramHeader::from_gimli(dwarf, unit, header, endian)?;
        Ok(Self::new(decoded, program))
    }

    pub fn header(&self) -> &LineProgramHeader
    {
        &self.header
    }

    /// A machine positioned at the start of the program.
    pub fn state_machine(&self) -> StateMachine
    {
        StateMachine::new(Arc::clone(&self.header), self.instructions.clone())
    }

    /// Source position of `pc`, or of the closest row before it.
    ///
    /// `base_pc` is normally the entry of the function containing `pc` and
    /// is only used as a cache key; zero disables caching. A base after `pc`
    /// cannot be used as a starting point and is ignored.
    pub fn pc_to_line(&self, base_pc: u64, pc: u64) -> Option<(Arc<str>, u32)>
    {
        if base_pc > pc {
            warn!(base_pc = format_args!("{base_pc:#x}"), pc = format_args!("{pc:#x}"), "base PC after PC");
        }
        if base_pc == 0 || base_pc > pc {
            return to_position(self.state_machine().pc_to_line(pc));
        }

        let mut last_used = self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        let mut machine = match last_used.remove(&base_pc) {
            Some(machine) if machine.last_address <= pc => machine,
            _ => self.fork_canonical(base_pc),
        };
        let found = machine.pc_to_line(pc);
        last_used.insert(base_pc, machine);
        to_position(found)
    }

    fn fork_canonical(&self, base_pc: u64) -> StateMachine
    {
        let mut canonical = self.canonical.lock().unwrap_or_else(PoisonError::into_inner);
        canonical
            .entry(base_pc)
            .or_insert_with(|| {
                trace!(base_pc = format_args!("{base_pc:#x}"), "parking line machine at function entry");
                let mut machine = self.state_machine();
                machine.pc_to_line(base_pc);
                machine
            })
            .clone()
    }

    /// First address in program order attributed to `file:line`.
    pub fn line_to_pc(&self, file: &str, line: u32) -> Option<u64>
    {
        let line = i64::from(line);
        let mut machine = self.state_machine();
        let mut found_file = false;
        while machine.next() {
            if found_file && &*machine.file != file {
                break;
            }
            if machine.line == line && &*machine.file == file {
                found_file = true;
                if machine.valid {
                    return Some(machine.address);
                }
            }
        }
        None
    }

    /// Every address at which execution enters `file:line`.
    ///
    /// Consecutive rows on the same line count once, so a loop header yields
    /// one address per re-entry rather than one per instruction.
    pub fn all_pcs_for_file_line(&self, file: &str, line: u32) -> Vec<u64>
    {
        let line = i64::from(line);
        let mut pcs = Vec::new();
        let mut machine = self.state_machine();
        let mut found_file = false;
        let mut last_address = None;

        while machine.next() {
            if found_file && &*machine.file != file {
                break;
            }
            if machine.line != line || &*machine.file != file || last_address == Some(machine.address) {
                continue;
            }
            found_file = true;
            if machine.valid {
                pcs.push(machine.address);
                last_address = Some(machine.address);
            }
            while machine.next() {
                if machine.line != line {
                    break;
                }
            }
        }
        pcs
    }

    /// Addresses of the rows in `[begin, end]`, ascending and without
    /// duplicates.
    ///
    /// End-of-sequence rows are left out: their address is one past the
    /// last instruction of the sequence.
    pub fn all_pcs_between(&self, begin: u64, end: u64) -> Vec<u64>
    {
        let mut pcs: Vec<u64> = Vec::new();
        let mut machine = self.state_machine();
        while machine.next() {
            if !machine.valid || machine.end_sequence {
                continue;
            }
            if machine.address > end {
                break;
            }
            let ascending = pcs.last().is_none_or(|last| machine.address > *last);
            if machine.address >= begin && ascending {
                pcs.push(machine.address);
            }
        }
        pcs
    }
}

fn to_position(found: Option<(Arc<str>, i64)>) -> Option<(Arc<str>, u32)>
{
    let (file, line) = found?;
    Some((file, u32::try_from(line).ok()?))
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::line::testing::ProgramBuilder;

    const MAIN: &str = "/src/main.go";

    fn table(builder: ProgramBuilder) -> LineTable
    {
        let (header, program) = builder.finish();
        let bytes = program.to_slice().unwrap().into_owned();
        LineTable::new((*header).clone(), bytes)
    }

    /// Lines 10..=14 with line 11 as a loop header entered twice.
    fn loop_program() -> LineTable
    {
        table(
            ProgramBuilder::new(&[MAIN, "/src/other.go"])
                .set_address(0x1000)
                .advance_line(9)
                .copy() // 10 @ 0x1000
                .special(1, 4) // 11 @ 0x1004
                .special(0, 2) // 11 @ 0x1006
                .special(1, 4) // 12 @ 0x100a
                .special(1, 4) // 13 @ 0x100e
                .special(-2, 4) // 11 @ 0x1012
                .special(3, 4) // 14 @ 0x1016
                .advance_pc(2)
                .end_sequence()
                .set_file(2)
                .set_address(0x2000)
                .advance_line(10)
                .copy(), // other.go:11 @ 0x2000
        )
    }

    #[test]
    fn test_pc_to_line_exact_and_preceding_rows()
    {
        let table = loop_program();
        assert_eq!(table.pc_to_line(0, 0x1004), Some((Arc::from(MAIN), 11)));
        assert_eq!(table.pc_to_line(0, 0x1008), Some((Arc::from(MAIN), 11)));
        assert_eq!(table.pc_to_line(0, 0x100b), Some((Arc::from(MAIN), 12)));
        assert_eq!(table.pc_to_line(0, 0x0fff), None);
    }

    #[test]
    fn test_line_to_pc_round_trips()
    {
        let table = loop_program();
        for line in 10..=14 {
            let pc = table.line_to_pc(MAIN, line).unwrap();
            assert_eq!(table.pc_to_line(0x1000, pc), Some((Arc::from(MAIN), line)));
        }
        assert_eq!(table.line_to_pc(MAIN, 99), None);
        assert_eq!(table.line_to_pc("/src/other.go", 11), Some(0x2000));
    }

    #[test]
    fn test_all_pcs_for_loop_header_once_per_entry()
    {
        let table = loop_program();
        assert_eq!(table.all_pcs_for_file_line(MAIN, 11), vec![0x1004, 0x1012]);
        assert_eq!(table.all_pcs_for_file_line(MAIN, 14), vec![0x1016]);
        assert!(table.all_pcs_for_file_line(MAIN, 20).is_empty());
    }

    #[test]
    fn test_all_pcs_between_is_ascending_and_bounded()
    {
        let table = loop_program();
        assert_eq!(table.all_pcs_between(0x1004, 0x100e), vec![0x1004, 0x1006, 0x100a, 0x100e]);
        assert_eq!(table.all_pcs_between(0x1000, 0x1000), vec![0x1000]);
    }

    #[test]
    fn test_all_pcs_between_leaves_out_end_of_sequence()
    {
        let table = loop_program();
        // The sequence ends at 0x1018
        assert_eq!(table.all_pcs_between(0x1010, 0x1100), vec![0x1012, 0x1016]);
        assert!(table.all_pcs_between(0x1018, 0x1018).is_empty());
    }

    #[test]
    fn test_cached_lookups_move_backwards()
    {
        let table = loop_program();
        assert_eq!(table.pc_to_line(0x1000, 0x1012).map(|(_, line)| line), Some(11));
        // Behind the last used machine: served from the parked entry machine.
        assert_eq!(table.pc_to_line(0x1000, 0x1004).map(|(_, line)| line), Some(11));
        assert_eq!(table.pc_to_line(0x1000, 0x100e).map(|(_, line)| line), Some(13));
        assert_eq!(table.pc_to_line(0x1000, 0x1000).map(|(_, line)| line), Some(10));
    }

    #[test]
    fn test_base_after_pc_falls_back_to_fresh_machine()
    {
        let table = loop_program();
        assert_eq!(table.pc_to_line(0x2000, 0x100a).map(|(_, line)| line), Some(12));
    }

    #[test]
    fn test_lines_are_monotonic_within_straight_code()
    {
        let table = loop_program();
        let pcs = table.all_pcs_between(0x1000, 0x100e);
        let lines: Vec<u32> = pcs
            .iter()
            .filter_map(|pc| table.pc_to_line(0x1000, *pc).map(|(_, line)| line))
            .collect();
        assert!(lines.windows(2).all(|pair| pair[0] <= pair[1]));
    }
}

//! The DWARF line number program interpreter.

use std::sync::Arc;

use gimli::constants;
use gimli::Reader;

use super::header::{FileEntry, LineProgramHeader};
use crate::OwnedReader;

/// Interpreter state over one line number program
///
/// Cloning is cheap and yields a fully independent machine: the instruction
/// bytes are shared, but each clone has its own read position. Callers park a
/// machine at a function entry and fork it for repeated lookups instead of
/// replaying the program from the start.
///
/// Running out of instructions is how traversal ends; [`StateMachine::next`]
/// reports it by returning `false`.
#[derive(Debug, Clone)]
pub struct StateMachine
{
    header: Arc<LineProgramHeader>,
    /// Unread instruction bytes
    instructions: OwnedReader,
    defined_files: Vec<FileEntry>,

    pub(crate) file: Arc<str>,
    pub(crate) line: i64,
    pub(crate) address: u64,
    column: u64,
    is_stmt: bool,
    basic_block: bool,
    pub(crate) end_sequence: bool,
    /// The registers describe a row of the line table
    pub(crate) valid: bool,
    started: bool,

    /// Row before the current one
    pub(crate) last_address: u64,
    last_file: Arc<str>,
    last_line: i64,
    has_last: bool,
}

impl StateMachine
{
    /// A machine positioned before the first instruction.
    pub fn new(header: Arc<LineProgramHeader>, instructions: OwnedReader) -> Self
    {
        let file = header.first_file();
        Self {
            is_stmt: header.default_is_stmt,
            header,
            instructions,
            defined_files: Vec::new(),
            last_file: Arc::clone(&file),
            file,
            line: 1,
            address: 0,
            column: 0,
            basic_block: false,
            end_sequence: false,
            valid: false,
            started: false,
            last_address: 0,
            last_line: 0,
            has_last: false,
        }
    }

    pub fn file(&self) -> &str
    {
        &self.file
    }

    pub fn line(&self) -> i64
    {
        self.line
    }

    pub fn address(&self) -> u64
    {
        self.address
    }

    pub fn column(&self) -> u64
    {
        self.column
    }

    pub fn is_stmt(&self) -> bool
    {
        self.is_stmt
    }

    pub fn is_valid(&self) -> bool
    {
        self.valid
    }

    /// Execute one opcode. Returns `false` once the program is exhausted or
    /// an operand runs past the end of it.
    pub fn next(&mut self) -> bool
    {
        self.started = true;
        if self.valid {
            self.last_address = self.address;
            self.last_file = Arc::clone(&self.file);
            self.last_line = self.line;
            self.has_last = true;
        }
        if self.end_sequence {
            self.end_sequence = false;
            self.file = self.header.first_file();
            self.line = 1;
            self.column = 0;
            self.is_stmt = self.header.default_is_stmt;
            self.basic_block = false;
        }

        let Ok(opcode) = self.instructions.read_u8() else {
            return false;
        };
        let outcome = if opcode >= self.header.opcode_base {
            self.special(opcode);
            Ok(())
        } else if opcode == 0 {
            self.valid = false;
            self.extended()
        } else {
            self.valid = false;
            self.standard(opcode)
        };
        outcome.is_ok()
    }

    /// Resolve `pc` by running forward from the current position.
    ///
    /// Answers with the row at `pc`, or the closest row before it. Returns
    /// `None` when the machine has already moved past `pc` or the program
    /// has no row at or before it.
    pub fn pc_to_line(&mut self, pc: u64) -> Option<(Arc<str>, i64)>
    {
        if !self.started && !self.next() {
            return None;
        }
        if self.last_address > pc {
            return None;
        }
        loop {
            if self.valid {
                if self.address > pc {
                    return self.has_last.then(|| (Arc::clone(&self.last_file), self.last_line));
                }
                if self.address == pc {
                    return Some((Arc::clone(&self.file), self.line));
                }
            }
            if !self.next() {
                break;
            }
        }
        self.valid.then(|| (Arc::clone(&self.file), self.line))
    }

    fn special(&mut self, opcode: u8)
    {
        let header = &self.header;
        let adjusted = opcode - header.opcode_base;
        let line_range = header.line_range.max(1);
        self.line += i64::from(header.line_base) + i64::from(adjusted % line_range);
        self.address = self
            .address
            .wrapping_add(u64::from(adjusted / line_range) * u64::from(header.minimum_instruction_length));
        if header.default_is_stmt {
            self.is_stmt = true;
        }
        self.basic_block = false;
        self.valid = true;
    }

    fn standard(&mut self, opcode: u8) -> gimli::Result<()>
    {
        match gimli::DwLns(opcode) {
            constants::DW_LNS_copy => {
                self.basic_block = false;
                self.valid = true;
            }
            constants::DW_LNS_advance_pc => {
                let advance = self.instructions.read_uleb128()?;
                self.address = self
                    .address
                    .wrapping_add(advance.wrapping_mul(u64::from(self.header.minimum_instruction_length)));
            }
            constants::DW_LNS_advance_line => {
                self.line += self.instructions.read_sleb128()?;
            }
            constants::DW_LNS_set_file => {
                let index = self.instructions.read_uleb128()?;
                self.file = self
                    .header
                    .file_path(index, &self.defined_files)
                    .map_or_else(|| Arc::from(""), Arc::clone);
            }
            constants::DW_LNS_set_column => {
                self.column = self.instructions.read_uleb128()?;
            }
            constants::DW_LNS_negate_stmt => self.is_stmt = !self.is_stmt,
            constants::DW_LNS_set_basic_block => self.basic_block = true,
            constants::DW_LNS_const_add_pc => {
                let header = &self.header;
                let adjusted = 255 - header.opcode_base;
                self.address = self.address.wrapping_add(
                    u64::from(adjusted / header.line_range.max(1)) * u64::from(header.minimum_instruction_length),
                );
            }
            constants::DW_LNS_fixed_advance_pc => {
                self.address = self.address.wrapping_add(u64::from(self.instructions.read_u16()?));
            }
            _ => {
                // Opcodes this interpreter does not model still declare how
                // many LEB128 operands follow them.
                let operands = self
                    .header
                    .standard_opcode_lengths
                    .get(usize::from(opcode) - 1)
                    .copied()
                    .unwrap_or(0);
                for _ in 0..operands {
                    self.instructions.read_uleb128()?;
                }
            }
        }
        Ok(())
    }

    fn extended(&mut self) -> gimli::Result<()>
    {
        let length = self.instructions.read_uleb128()?;
        if length == 0 {
            return Ok(());
        }
        let opcode = gimli::DwLne(self.instructions.read_u8()?);
        let operand_length = length - 1;
        match opcode {
            constants::DW_LNE_end_sequence => {
                self.end_sequence = true;
                self.valid = true;
            }
            constants::DW_LNE_set_address => {
                self.address = self.instructions.read_address(operand_length as u8)?;
            }
            constants::DW_LNE_define_file => {
                let name = self.instructions.read_null_terminated_slice()?;
                let name = name.to_string_lossy()?.into_owned();
                let directory_index = self.instructions.read_uleb128()?;
                let modification_time = self.instructions.read_uleb128()?;
                let length = self.instructions.read_uleb128()?;
                let path = self.header.join_directory(&name, directory_index);
                self.defined_files.push(FileEntry {
                    path: path.into(),
                    directory_index,
                    modification_time,
                    length,
                });
            }
            _ => {
                self.instructions.skip(operand_length as usize)?;
            }
        }
        Ok(())
    }
}

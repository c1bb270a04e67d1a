//! Hand assembly of line number programs for unit tests.

use std::sync::Arc;

use gimli::constants;
use gimli::leb128;

use super::header::{FileEntry, LineProgramHeader};
use super::table::LineTable;
use crate::OwnedReader;

/// Emits opcodes against the default x86-64 header parameters.
pub(crate) struct ProgramBuilder
{
    header: LineProgramHeader,
    bytes: Vec<u8>,
}

impl ProgramBuilder
{
    pub(crate) fn new(files: &[&str]) -> Self
    {
        Self {
            header: LineProgramHeader {
                file_names: files.iter().map(|file| FileEntry::new(*file)).collect(),
                ..LineProgramHeader::default()
            },
            bytes: Vec::new(),
        }
    }

    pub(crate) fn raw(mut self, bytes: &[u8]) -> Self
    {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub(crate) fn copy(self) -> Self
    {
        self.raw(&[constants::DW_LNS_copy.0])
    }

    pub(crate) fn advance_pc(mut self, delta: u64) -> Self
    {
        self.bytes.push(constants::DW_LNS_advance_pc.0);
        leb128::write::unsigned(&mut self.bytes, delta).unwrap();
        self
    }

    pub(crate) fn advance_line(mut self, delta: i64) -> Self
    {
        self.bytes.push(constants::DW_LNS_advance_line.0);
        leb128::write::signed(&mut self.bytes, delta).unwrap();
        self
    }

    pub(crate) fn set_file(mut self, index: u64) -> Self
    {
        self.bytes.push(constants::DW_LNS_set_file.0);
        leb128::write::unsigned(&mut self.bytes, index).unwrap();
        self
    }

    /// Special opcode moving the line by `line` and the address by `address`.
    pub(crate) fn special(self, line: i64, address: u64) -> Self
    {
        let header = &self.header;
        let opcode = (line - i64::from(header.line_base))
            + i64::from(header.line_range) * address as i64
            + i64::from(header.opcode_base);
        let opcode = u8::try_from(opcode).unwrap();
        self.raw(&[opcode])
    }

    pub(crate) fn set_address(mut self, address: u64) -> Self
    {
        self.bytes.extend_from_slice(&[0, 9, constants::DW_LNE_set_address.0]);
        self.bytes.extend_from_slice(&address.to_le_bytes());
        self
    }

    pub(crate) fn end_sequence(self) -> Self
    {
        self.raw(&[0, 1, constants::DW_LNE_end_sequence.0])
    }

    pub(crate) fn define_file(mut self, name: &str) -> Self
    {
        let mut body = vec![constants::DW_LNE_define_file.0];
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(&[0, 0, 0, 0]);
        self.bytes.push(0);
        leb128::write::unsigned(&mut self.bytes, body.len() as u64).unwrap();
        self.bytes.extend_from_slice(&body);
        self
    }

    /// Build a [`LineTable`] over the assembled program.
    pub(crate) fn table(self) -> LineTable
    {
        LineTable::new(self.header, self.bytes)
    }

    pub(crate) fn finish(self) -> (Arc<LineProgramHeader>, OwnedReader)
    {
        let endian = self.header.endian;
        (
            Arc::new(self.header),
            OwnedReader::new(Arc::from(self.bytes.into_boxed_slice()), endian),
        )
    }
}

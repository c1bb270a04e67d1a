//! Line number program headers.

use std::path::Path;
use std::sync::Arc;

use gimli::{Reader, RunTimeEndian};

use crate::error::{QuarryError, QuarryResult};

/// A file named by a line program header or a `DW_LNE_define_file` opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry
{
    /// Full path, already joined with its include directory
    pub path: Arc<str>,
    pub directory_index: u64,
    pub modification_time: u64,
    pub length: u64,
}

impl FileEntry
{
    pub fn new(path: impl Into<Arc<str>>) -> Self
    {
        Self {
            path: path.into(),
            directory_index: 0,
            modification_time: 0,
            length: 0,
        }
    }
}

/// The decoded prologue of one compilation unit's line program
///
/// Holds the parameters of the special-opcode formula, the operand counts of
/// every standard opcode, and the file table the program's `set_file`
/// operands index into.
#[derive(Debug, Clone)]
pub struct LineProgramHeader
{
    /// DWARF version; from 5 on, file indices are zero-based
    pub version: u16,
    pub minimum_instruction_length: u8,
    pub default_is_stmt: bool,
    pub line_base: i8,
    pub line_range: u8,
    pub opcode_base: u8,
    /// Operand count of standard opcode `n` at index `n - 1`
    pub standard_opcode_lengths: Vec<u8>,
    /// Include directories in DWARF index order
    pub include_directories: Vec<String>,
    pub file_names: Vec<FileEntry>,
    pub address_size: u8,
    pub endian: RunTimeEndian,
}

impl Default for LineProgramHeader
{
    /// The parameters most compilers emit for x86-64: `line_base = -5`,
    /// `line_range = 14`, `opcode_base = 13`.
    fn default() -> Self
    {
        Self {
            version: 4,
            minimum_instruction_length: 1,
            default_is_stmt: true,
            line_base: -5,
            line_range: 14,
            opcode_base: 13,
            standard_opcode_lengths: vec![0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1],
            include_directories: Vec::new(),
            file_names: Vec::new(),
            address_size: 8,
            endian: RunTimeEndian::Little,
        }
    }
}

impl LineProgramHeader
{
    /// Path a `set_file` operand refers to, looking past the header's table
    /// into files defined by the program itself.
    pub(crate) fn file_path<'a>(&'a self, index: u64, defined: &'a [FileEntry]) -> Option<&'a Arc<str>>
    {
        let index = if self.version >= 5 { index } else { index.checked_sub(1)? };
        let index = usize::try_from(index).ok()?;
        match self.file_names.get(index) {
            Some(entry) => Some(&entry.path),
            None => defined.get(index - self.file_names.len()).map(|entry| &entry.path),
        }
    }

    /// File a fresh or reset sequence starts in.
    pub(crate) fn first_file(&self) -> Arc<str>
    {
        self.file_names
            .first()
            .map_or_else(|| Arc::from(""), |entry| Arc::clone(&entry.path))
    }

    /// Join `name` with include directory `directory_index` unless it is
    /// already absolute.
    pub(crate) fn join_directory(&self, name: &str, directory_index: u64) -> String
    {
        if Path::new(name).is_absolute() {
            return name.to_string();
        }
        let directory = usize::try_from(directory_index)
            .ok()
            .and_then(|index| self.include_directories.get(index))
            .filter(|directory| !directory.is_empty());
        match directory {
            Some(directory) => Path::new(directory).join(name).to_string_lossy().into_owned(),
            None => name.to_string(),
        }
    }

    /// Convert a header parsed by gimli, resolving every string through the
    /// unit's string sections.
    pub(crate) fn from_gimli<R>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        header: &gimli::LineProgramHeader<R>,
        endian: RunTimeEndian,
    ) -> QuarryResult<Self>
    where
        R: Reader,
    {
        let attr_string = |value: gimli::AttributeValue<R>| -> QuarryResult<String> {
            let reader = dwarf
                .attr_string(unit, value)
                .map_err(|err| QuarryError::dwarf("resolving line table string", err))?;
            let text = reader
                .to_string_lossy()
                .map_err(|err| QuarryError::dwarf("decoding line table string", err))?;
            Ok(text.into_owned())
        };

        let mut include_directories = Vec::new();
        let mut index = 0u64;
        while let Some(directory) = header.directory(index) {
            include_directories.push(attr_string(directory)?);
            index += 1;
        }

        let mut program = Self {
            version: header.version(),
            minimum_instruction_length: header.minimum_instruction_length(),
            default_is_stmt: header.default_is_stmt(),
            line_base: header.line_base(),
            line_range: header.line_range(),
            opcode_base: header.opcode_base(),
            standard_opcode_lengths: header
                .standard_opcode_lengths()
                .to_slice()
                .map_err(|err| QuarryError::dwarf("reading standard opcode lengths", err))?
                .into_owned(),
            include_directories,
            file_names: Vec::new(),
            address_size: header.address_size(),
            endian,
        };

        for entry in header.file_names() {
            let name = attr_string(entry.path_name())?;
            let path = program.join_directory(&name, entry.directory_index());
            program.file_names.push(FileEntry {
                path: path.into(),
                directory_index: entry.directory_index(),
                modification_time: entry.timestamp(),
                length: entry.size(),
            });
        }

        Ok(program)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn header_with_files(version: u16) -> LineProgramHeader
    {
        LineProgramHeader {
            version,
            include_directories: vec![String::new(), "/src/app".into()],
            file_names: vec![FileEntry::new("/src/app/main.go"), FileEntry::new("/src/app/util.go")],
            ..LineProgramHeader::default()
        }
    }

    #[test]
    fn test_file_indices_are_one_based_before_dwarf5()
    {
        let header = header_with_files(4);
        assert_eq!(header.file_path(0, &[]), None);
        assert_eq!(header.file_path(1, &[]).map(|p| &**p), Some("/src/app/main.go"));
        assert_eq!(header.file_path(2, &[]).map(|p| &**p), Some("/src/app/util.go"));
    }

    #[test]
    fn test_file_indices_are_zero_based_from_dwarf5()
    {
        let header = header_with_files(5);
        assert_eq!(header.file_path(0, &[]).map(|p| &**p), Some("/src/app/main.go"));
    }

    #[test]
    fn test_defined_files_follow_header_files()
    {
        let header = header_with_files(4);
        let defined = vec![FileEntry::new("/tmp/gen.go")];
        assert_eq!(header.file_path(3, &defined).map(|p| &**p), Some("/tmp/gen.go"));
        assert_eq!(header.file_path(4, &defined), None);
    }

    #[test]
    fn test_relative_names_join_their_directory()
    {
        let header = header_with_files(4);
        assert_eq!(header.join_directory("gen.go", 1), "/src/app/gen.go");
        assert_eq!(header.join_directory("/abs/x.go", 1), "/abs/x.go");
        assert_eq!(header.join_directory("x.go", 0), "x.go");
    }
}

//! Loading [`BinaryInfo`] from an executable on disk.
//!
//! Reads function ranges, frame base expressions and per-unit line tables
//! out of `.debug_info`/`.debug_line`, and call frame information out of
//! `.debug_frame` (or `.eh_frame` when the former is absent). Mach-O
//! `__debug_*` section names are accepted as well.

use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use gimli::{constants, AttributeValue, DebuggingInformationEntry, Dwarf, Reader, RunTimeEndian, SectionId, Unit};
use object::{Object, ObjectSection};
use tracing::{debug, warn};

use super::function::Function;
use super::info::{BinaryInfo, BinaryInfoBuilder};
use crate::error::{QuarryError, QuarryResult};
use crate::frame::{CfiSectionKind, CfiTable};
use crate::line::LineTable;
use crate::types::Architecture;
use crate::OwnedReader;

struct SectionBlob
{
    data: Arc<[u8]>,
    address: u64,
}

fn load_section(file: &object::File<'_>, name: &str) -> QuarryResult<Option<SectionBlob>>
{
    let mach_o = format!("__{}", name.trim_start_matches('.'));
    for candidate in [name, mach_o.as_str()] {
        if let Some(section) = file.section_by_name(candidate) {
            let data = section
                .uncompressed_data()
                .map_err(|err| QuarryError::Object(format!("failed to read {candidate}: {err}")))?;
            let data: Arc<[u8]> = match data {
                Cow::Borrowed(bytes) => Arc::from(bytes),
                Cow::Owned(bytes) => bytes.into(),
            };
            return Ok(Some(SectionBlob {
                data,
                address: section.address(),
            }));
        }
    }
    Ok(None)
}

impl BinaryInfo
{
    /// Read the debug information of the executable at `path`.
    pub fn load(path: impl AsRef<Path>) -> QuarryResult<BinaryInfo>
    {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let file = object::File::parse(&*bytes).map_err(|err| QuarryError::Object(err.to_string()))?;

        let architecture = match file.architecture() {
            object::Architecture::X86_64 => Architecture::X86_64,
            object::Architecture::Aarch64 => Architecture::Arm64,
            other => return Err(QuarryError::Unsupported(format!("architecture {other:?}"))),
        };
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let dwarf = Dwarf::load(|id: SectionId| -> QuarryResult<OwnedReader> {
            let data = load_section(&file, id.name())?.map_or_else(|| Arc::from(Vec::new()), |blob| blob.data);
            Ok(OwnedReader::new(data, endian))
        })?;

        let mut builder = BinaryInfoBuilder::new(architecture);
        let mut units = dwarf.units();
        while let Some(header) = units
            .next()
            .map_err(|err| QuarryError::dwarf("reading unit header", err))?
        {
            let unit = dwarf
                .unit(header)
                .map_err(|err| QuarryError::dwarf("parsing unit", err))?;
            if let Err(err) = load_unit(&dwarf, &unit, endian, &mut builder) {
                warn!(%err, "skipping compilation unit");
            }
        }

        if let Some(blob) = load_section(&file, ".debug_frame")? {
            builder = builder.frames(CfiTable::new(
                CfiSectionKind::DebugFrame,
                blob.data,
                blob.address,
                architecture,
                endian,
            ));
        } else if let Some(blob) = load_section(&file, ".eh_frame")? {
            builder = builder.frames(CfiTable::new(
                CfiSectionKind::EhFrame,
                blob.data,
                blob.address,
                architecture,
                endian,
            ));
        }

        debug!(path = %path.display(), %architecture, "loaded binary");
        Ok(builder.build())
    }
}

fn load_unit(
    dwarf: &Dwarf<OwnedReader>,
    unit: &Unit<OwnedReader>,
    endian: RunTimeEndian,
    builder: &mut BinaryInfoBuilder,
) -> QuarryResult<()>
{
    let line_table = match &unit.line_program {
        Some(program) => Some(Arc::new(LineTable::from_header(dwarf, unit, program.header(), endian)?)),
        None => None,
    };
    if let Some(table) = &line_table {
        builder.add_line_table(Arc::clone(table));
    }

    let mut cursor = unit.entries();
    while let Some((_delta, entry)) = cursor
        .next_dfs()
        .map_err(|err| QuarryError::dwarf("traversing DIE tree", err))?
    {
        if entry.tag() != constants::DW_TAG_subprogram {
            continue;
        }
        let Some(name) = entry_name(dwarf, unit, entry)? else {
            continue;
        };
        let Some((entry_pc, end_pc)) = pc_range(dwarf, unit, entry)? else {
            continue;
        };
        let mut function = Function::new(name, entry_pc, end_pc);
        if let Some(AttributeValue::Exprloc(expression)) = entry
            .attr_value(constants::DW_AT_frame_base)
            .map_err(|err| QuarryError::dwarf("reading DW_AT_frame_base", err))?
        {
            let bytes = expression
                .0
                .to_slice()
                .map_err(|err| QuarryError::dwarf("reading frame base", err))?;
            function = function.with_frame_base(bytes.into_owned());
        }
        if let Some(table) = &line_table {
            function = function.with_line_table(Arc::clone(table));
        }
        builder.add_function(function);
    }
    Ok(())
}

fn entry_name(
    dwarf: &Dwarf<OwnedReader>,
    unit: &Unit<OwnedReader>,
    entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
) -> QuarryResult<Option<String>>
{
    for attribute in [constants::DW_AT_name, constants::DW_AT_linkage_name] {
        if let Some(attr) = entry
            .attr(attribute)
            .map_err(|err| QuarryError::dwarf("reading function name", err))?
        {
            let reader = dwarf
                .attr_string(unit, attr.value())
                .map_err(|err| QuarryError::dwarf("resolving function name", err))?;
            let name = reader
                .to_string_lossy()
                .map_err(|err| QuarryError::dwarf("decoding function name", err))?;
            return Ok(Some(name.into_owned()));
        }
    }
    Ok(None)
}

fn pc_range(
    dwarf: &Dwarf<OwnedReader>,
    unit: &Unit<OwnedReader>,
    entry: &DebuggingInformationEntry<'_, '_, OwnedReader>,
) -> QuarryResult<Option<(u64, u64)>>
{
    let Some(low) = entry
        .attr_value(constants::DW_AT_low_pc)
        .map_err(|err| QuarryError::dwarf("reading DW_AT_low_pc", err))?
    else {
        return Ok(None);
    };
    let Some(low) = dwarf
        .attr_address(unit, low)
        .map_err(|err| QuarryError::dwarf("resolving DW_AT_low_pc", err))?
    else {
        return Ok(None);
    };
    let high = match entry
        .attr_value(constants::DW_AT_high_pc)
        .map_err(|err| QuarryError::dwarf("reading DW_AT_high_pc", err))?
    {
        Some(AttributeValue::Udata(length)) => low + length,
        Some(value) => match dwarf
            .attr_address(unit, value)
            .map_err(|err| QuarryError::dwarf("resolving DW_AT_high_pc", err))?
        {
            Some(high) => high,
            None => return Ok(None),
        },
        None => return Ok(None),
    };
    Ok(Some((low, high)))
}

//! Frame descriptions decoded from `.eh_frame` or `.debug_frame`.

use std::sync::Arc;

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, DebugFrame, EhFrame, Reader, RegisterRule, UnwindContext, UnwindSection,
};
use once_cell::sync::OnceCell;
use tracing::debug;

use super::rules::{FrameContext, FrameDescriptionLookup, FrameRule};
use crate::error::{QuarryError, QuarryResult};
use crate::types::Architecture;
use crate::OwnedReader;

type Fde = gimli::FrameDescriptionEntry<OwnedReader>;

/// Which unwind section the table was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiSectionKind
{
    /// `.eh_frame`, with pointer encodings relative to the section address
    EhFrame,
    /// `.debug_frame`
    DebugFrame,
}

#[derive(Debug, Clone)]
enum Section
{
    Eh(EhFrame<OwnedReader>),
    Debug(DebugFrame<OwnedReader>),
}

/// Call frame information backed by gimli
///
/// The section is parsed once, on the first lookup, into a list of frame
/// description entries sorted by start address. Every later lookup is a
/// binary search followed by running that entry's CFA program up to the
/// requested address.
#[derive(Debug)]
pub struct CfiTable
{
    section: Section,
    bases: BaseAddresses,
    fdes: OnceCell<Vec<Fde>>,
}

impl CfiTable
{
    /// Wrap the raw bytes of an unwind section.
    ///
    /// `section_address` is where the section is loaded; `.eh_frame` pointer
    /// encodings are resolved against it.
    pub fn new(
        kind: CfiSectionKind,
        data: impl Into<Arc<[u8]>>,
        section_address: u64,
        architecture: Architecture,
        endian: gimli::RunTimeEndian,
    ) -> Self
    {
        let reader = OwnedReader::new(data.into(), endian);
        let (section, bases) = match kind {
            CfiSectionKind::EhFrame => {
                let mut section = EhFrame::from(reader);
                section.set_address_size(architecture.pointer_size());
                (Section::Eh(section), BaseAddresses::default().set_eh_frame(section_address))
            }
            CfiSectionKind::DebugFrame => {
                let mut section = DebugFrame::from(reader);
                section.set_address_size(architecture.pointer_size());
                (Section::Debug(section), BaseAddresses::default())
            }
        };
        Self {
            section,
            bases,
            fdes: OnceCell::new(),
        }
    }

    fn entries(&self) -> QuarryResult<&[Fde]>
    {
        let fdes = self.fdes.get_or_try_init(|| match &self.section {
            Section::Eh(section) => parse_entries(section, &self.bases),
            Section::Debug(section) => parse_entries(section, &self.bases),
        })?;
        Ok(fdes)
    }

    /// Number of frame description entries in the section.
    pub fn len(&self) -> QuarryResult<usize>
    {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> QuarryResult<bool>
    {
        Ok(self.entries()?.is_empty())
    }
}

impl FrameDescriptionLookup for CfiTable
{
    fn frame_context(&self, pc: u64) -> QuarryResult<FrameContext>
    {
        let fdes = self.entries()?;
        let index = fdes.partition_point(|fde| fde.initial_address() <= pc);
        let Some(fde) = index.checked_sub(1).and_then(|index| fdes.get(index)) else {
            return Err(QuarryError::NoFrameDescription(pc));
        };
        if !fde.contains(pc) {
            return Err(QuarryError::NoFrameDescription(pc));
        }
        match &self.section {
            Section::Eh(section) => establish_frame(section, &self.bases, fde, pc),
            Section::Debug(section) => establish_frame(section, &self.bases, fde, pc),
        }
    }
}

fn parse_entries<S>(section: &S, bases: &BaseAddresses) -> QuarryResult<Vec<Fde>>
where
    S: UnwindSection<OwnedReader>,
{
    let mut fdes = Vec::new();
    let mut entries = section.entries(bases);
    while let Some(entry) = entries
        .next()
        .map_err(|err| QuarryError::dwarf("reading unwind entry", err))?
    {
        let CieOrFde::Fde(partial) = entry else {
            continue;
        };
        match partial.parse(|unwind_section, base_addresses, cie_offset| {
            unwind_section.cie_from_offset(base_addresses, cie_offset)
        }) {
            Ok(fde) => fdes.push(fde),
            Err(err) => debug!(%err, "skipping malformed frame description entry"),
        }
    }
    fdes.sort_by_key(|fde| fde.initial_address());
    debug!(entries = fdes.len(), "indexed frame description entries");
    Ok(fdes)
}

fn establish_frame<S>(section: &S, bases: &BaseAddresses, fde: &Fde, pc: u64) -> QuarryResult<FrameContext>
where
    S: UnwindSection<OwnedReader>,
{
    let mut ctx = UnwindContext::<usize>::new();
    let row = match fde.unwind_info_for_address(section, bases, &mut ctx, pc) {
        Ok(row) => row,
        Err(gimli::Error::NoUnwindInfoForAddress) => return Err(QuarryError::NoFrameDescription(pc)),
        Err(err) => return Err(QuarryError::dwarf("evaluating unwind row", err)),
    };

    let expression_bytes = |expression: &gimli::UnwindExpression<usize>| -> QuarryResult<Vec<u8>> {
        let expression = expression
            .get(section)
            .map_err(|err| QuarryError::dwarf("reading unwind expression", err))?;
        Ok(expression.0.to_slice().map_err(|err| QuarryError::dwarf("reading unwind expression", err))?.into_owned())
    };

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => FrameRule::Cfa {
            register: register.0,
            offset: *offset,
        },
        CfaRule::Expression(expression) => FrameRule::Expression(expression_bytes(expression)?),
    };

    let mut context = FrameContext::new(cfa, fde.cie().return_address_register().0);
    for (register, rule) in row.registers() {
        let rule = match rule {
            RegisterRule::Undefined => FrameRule::Undefined,
            RegisterRule::SameValue => FrameRule::SameValue,
            RegisterRule::Offset(offset) => FrameRule::Offset(*offset),
            RegisterRule::ValOffset(offset) => FrameRule::ValOffset(*offset),
            RegisterRule::Register(other) => FrameRule::Register(other.0),
            RegisterRule::Expression(expression) => FrameRule::Expression(expression_bytes(expression)?),
            RegisterRule::ValExpression(expression) => FrameRule::ValExpression(expression_bytes(expression)?),
            _ => FrameRule::Architectural,
        };
        context.regs.insert(register.0, rule);
    }
    Ok(context)
}

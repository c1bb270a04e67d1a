//! Functions, their lexical scopes and inlined calls.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use super::types::TypeId;
use crate::line::LineTable;

/// Where a variable lives, as described by the debug information
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LocationDescription
{
    /// One location expression valid over the whole scope
    Expression(Vec<u8>),
    /// Expressions valid over address ranges
    List(Vec<LocationListEntry>),
    /// Optimized out
    #[default]
    None,
}

/// One entry of a location list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationListEntry
{
    pub range: Range<u64>,
    pub expression: Vec<u8>,
}

impl LocationDescription
{
    /// The expression in effect at `pc`.
    pub fn expression_at(&self, pc: u64) -> Option<&[u8]>
    {
        match self {
            LocationDescription::Expression(expression) => Some(expression),
            LocationDescription::List(entries) => entries
                .iter()
                .find(|entry| entry.range.contains(&pc))
                .map(|entry| entry.expression.as_slice()),
            LocationDescription::None => None,
        }
    }
}

/// What a declared variable is to its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VariableRole
{
    #[default]
    Local,
    Argument,
    ReturnArgument,
}

/// A variable declared in a function scope or at package level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableEntry
{
    /// Declared name; heap-escaped locals carry a leading `&`
    pub name: String,
    pub ty: TypeId,
    pub location: LocationDescription,
    pub role: VariableRole,
    /// Line of the declaration; variables declared after the current line
    /// are not yet in scope
    pub decl_line: Option<u32>,
}

impl VariableEntry
{
    pub fn new(name: impl Into<String>, ty: TypeId, location: LocationDescription) -> Self
    {
        Self {
            name: name.into(),
            ty,
            location,
            role: VariableRole::Local,
            decl_line: None,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: VariableRole) -> Self
    {
        self.role = role;
        self
    }

    #[must_use]
    pub fn declared_at(mut self, line: u32) -> Self
    {
        self.decl_line = Some(line);
        self
    }
}

/// A lexical block and the variables it declares
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LexicalBlock
{
    /// Address ranges covered; empty for the function's root scope, which
    /// covers the whole function
    pub ranges: Vec<Range<u64>>,
    pub variables: Vec<VariableEntry>,
    pub blocks: Vec<LexicalBlock>,
}

impl LexicalBlock
{
    pub fn new(ranges: Vec<Range<u64>>) -> Self
    {
        Self {
            ranges,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_variable(mut self, variable: VariableEntry) -> Self
    {
        self.variables.push(variable);
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: LexicalBlock) -> Self
    {
        self.blocks.push(block);
        self
    }

    fn contains(&self, pc: u64) -> bool
    {
        self.ranges.is_empty() || self.ranges.iter().any(|range| range.contains(&pc))
    }

    fn collect<'a>(&'a self, pc: u64, line: Option<u32>, depth: usize, out: &mut Vec<(&'a VariableEntry, usize)>)
    {
        for variable in &self.variables {
            if let (Some(declared), Some(line)) = (variable.decl_line, line) {
                if declared > line {
                    continue;
                }
            }
            out.push((variable, depth));
        }
        for block in self.blocks.iter().filter(|block| !block.ranges.is_empty() && block.contains(pc)) {
            block.collect(pc, line, depth + 1, out);
        }
    }
}

/// A call the compiler inlined into its caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedCall
{
    /// Name of the inlined function
    pub function: String,
    pub ranges: Vec<Range<u64>>,
    /// Position of the call in the caller
    pub call_file: String,
    pub call_line: u32,
    /// Calls inlined into this one
    pub children: Vec<InlinedCall>,
}

impl InlinedCall
{
    pub fn new(function: impl Into<String>, range: Range<u64>, call_file: impl Into<String>, call_line: u32) -> Self
    {
        Self {
            function: function.into(),
            ranges: vec![range],
            call_file: call_file.into(),
            call_line,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: InlinedCall) -> Self
    {
        self.children.push(child);
        self
    }

    pub fn contains(&self, pc: u64) -> bool
    {
        self.ranges.iter().any(|range| range.contains(&pc))
    }
}

/// A function of the debugged program
#[derive(Clone)]
pub struct Function
{
    pub name: String,
    /// First instruction
    pub entry: u64,
    /// One past the last instruction
    pub end: u64,
    /// Location expression for the frame base (`DW_AT_frame_base`)
    pub frame_base: Option<Vec<u8>>,
    pub scope: LexicalBlock,
    pub inlined_calls: Vec<InlinedCall>,
    /// Line table of the compilation unit the function belongs to
    pub line_table: Option<Arc<LineTable>>,
}

impl Function
{
    pub fn new(name: impl Into<String>, entry: u64, end: u64) -> Self
    {
        Self {
            name: name.into(),
            entry,
            end,
            frame_base: None,
            scope: LexicalBlock::default(),
            inlined_calls: Vec::new(),
            line_table: None,
        }
    }

    #[must_use]
    pub fn with_frame_base(mut self, expression: Vec<u8>) -> Self
    {
        self.frame_base = Some(expression);
        self
    }

    #[must_use]
    pub fn with_line_table(mut self, table: Arc<LineTable>) -> Self
    {
        self.line_table = Some(table);
        self
    }

    /// Declare a variable in the function's root scope.
    #[must_use]
    pub fn with_variable(mut self, variable: VariableEntry) -> Self
    {
        self.scope.variables.push(variable);
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: LexicalBlock) -> Self
    {
        self.scope.blocks.push(block);
        self
    }

    #[must_use]
    pub fn with_inlined_call(mut self, call: InlinedCall) -> Self
    {
        self.inlined_calls.push(call);
        self
    }

    pub fn contains(&self, pc: u64) -> bool
    {
        (self.entry..self.end).contains(&pc)
    }

    /// Package part of the name: `main` for `main.f`, `net/http` for
    /// `net/http.(*Client).Do`.
    pub fn package_name(&self) -> &str
    {
        let slash = self.name.rfind('/').map_or(0, |index| index + 1);
        match self.name[slash..].find('.') {
            Some(dot) => &self.name[..slash + dot],
            None => "",
        }
    }

    /// Variables visible at `pc`, each with the nesting depth of the block
    /// that declares it. The root scope is depth 1. With a `line`, variables
    /// declared after it are skipped.
    pub fn variables_at(&self, pc: u64, line: Option<u32>) -> Vec<(&VariableEntry, usize)>
    {
        let mut out = Vec::new();
        self.scope.collect(pc, line, 1, &mut out);
        out
    }

    /// Inlined calls covering `pc`, innermost first.
    pub fn inlined_calls_at(&self, pc: u64) -> Vec<&InlinedCall>
    {
        let mut chain = Vec::new();
        let mut level = &self.inlined_calls;
        while let Some(call) = level.iter().find(|call| call.contains(pc)) {
            chain.push(call);
            level = &call.children;
        }
        chain.reverse();
        chain
    }
}

impl PartialEq for Function
{
    fn eq(&self, other: &Self) -> bool
    {
        self.name == other.name && self.entry == other.entry && self.end == other.end
    }
}

impl fmt::Debug for Function
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("end", &format_args!("{:#x}", self.end))
            .finish_non_exhaustive()
    }
}

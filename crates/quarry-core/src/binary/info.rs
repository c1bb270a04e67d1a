//! Everything known about one executable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::function::{Function, VariableEntry};
use super::types::{TypeId, TypeTable};
use crate::error::{QuarryError, QuarryResult};
use crate::frame::{FrameContext, FrameDescriptionLookup, FrameTable};
use crate::line::LineTable;
use crate::types::{Address, Architecture, Location};

/// An inlined call covering a call site, as reported by [`InlineLookup`]
#[derive(Debug, Clone, PartialEq)]
pub struct InlineRecord
{
    /// The inlined function
    pub function: Arc<Function>,
    /// Position of the call, in the function it was inlined into
    pub call_file: String,
    pub call_line: u32,
}

/// Inlined calls covering a call site
pub trait InlineLookup
{
    /// Records for the calls inlined at `pc` in `function`, innermost first.
    fn inlined_calls(&self, function: &Function, pc: u64) -> Vec<InlineRecord>;
}

/// Type resolution by name
pub trait TypeLookup
{
    fn find_type(&self, name: &str) -> QuarryResult<TypeId>;
}

/// A named constant of an integer type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantValue
{
    /// Name without its package qualifier
    pub name: String,
    pub full_name: String,
    pub value: i64,
    /// The value has exactly one bit set
    pub single_bit: bool,
}

/// Debug information of one executable
///
/// Owns the function table, every compilation unit's line table, the type
/// graph, package-level variables, constants, runtime type names and the
/// frame descriptions. Built once, then shared read-only (behind an `Arc`)
/// by every stack walk and evaluation.
pub struct BinaryInfo
{
    architecture: Architecture,
    functions: Vec<Arc<Function>>,
    functions_by_name: HashMap<String, Arc<Function>>,
    line_tables: Vec<Arc<LineTable>>,
    types: TypeTable,
    package_vars: Vec<VariableEntry>,
    constants: HashMap<TypeId, Vec<ConstantValue>>,
    runtime_types: HashMap<u64, String>,
    frames: Box<dyn FrameDescriptionLookup>,
}

impl BinaryInfo
{
    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    pub fn types(&self) -> &TypeTable
    {
        &self.types
    }

    pub fn functions(&self) -> &[Arc<Function>]
    {
        &self.functions
    }

    /// Function containing `pc`.
    pub fn pc_to_func(&self, pc: u64) -> Option<Arc<Function>>
    {
        let index = self.functions.partition_point(|function| function.entry <= pc);
        index
            .checked_sub(1)
            .and_then(|index| self.functions.get(index))
            .filter(|function| function.contains(pc))
            .cloned()
    }

    /// Function by fully qualified name.
    pub fn lookup_func(&self, name: &str) -> Option<&Arc<Function>>
    {
        self.functions_by_name.get(name)
    }

    /// Source position of `pc` and the function containing it.
    ///
    /// Addresses outside every function, or without a line table row,
    /// resolve to the unknown file with no line.
    pub fn pc_to_line(&self, pc: u64) -> Location
    {
        let Some(function) = self.pc_to_func(pc) else {
            return Location::unknown(Address::new(pc));
        };
        let position = function
            .line_table
            .as_ref()
            .and_then(|table| table.pc_to_line(function.entry, pc));
        match position {
            Some((file, line)) => Location {
                pc: Address::new(pc),
                file: file.to_string(),
                line: Some(line),
                function: Some(function),
            },
            None => Location {
                function: Some(function),
                ..Location::unknown(Address::new(pc))
            },
        }
    }

    /// First address of `file:line` in any compilation unit that also
    /// belongs to a function, with that function.
    pub fn line_to_pc(&self, file: &str, line: u32) -> Option<(u64, Arc<Function>)>
    {
        self.line_tables.iter().find_map(|table| {
            let pc = table.line_to_pc(file, line)?;
            self.pc_to_func(pc).map(|function| (pc, function))
        })
    }

    /// Package-level variables.
    pub fn package_vars(&self) -> &[VariableEntry]
    {
        &self.package_vars
    }

    /// Constants declared with type `ty`, sorted by value.
    pub fn constants_of(&self, ty: TypeId) -> Option<&[ConstantValue]>
    {
        self.constants.get(&ty).map(Vec::as_slice)
    }

    /// Every constant with its type.
    pub fn constants(&self) -> impl Iterator<Item = (TypeId, &ConstantValue)>
    {
        self.constants
            .iter()
            .flat_map(|(ty, values)| values.iter().map(move |value| (*ty, value)))
    }

    /// Name of the type whose runtime descriptor lives at `address`.
    pub fn runtime_type_name(&self, address: u64) -> Option<&str>
    {
        self.runtime_types.get(&address).map(String::as_str)
    }

    /// Unwind rules in effect at `pc`.
    pub fn frame_context(&self, pc: u64) -> QuarryResult<FrameContext>
    {
        self.frames.frame_context(pc)
    }
}

impl InlineLookup for BinaryInfo
{
    fn inlined_calls(&self, function: &Function, pc: u64) -> Vec<InlineRecord>
    {
        function
            .inlined_calls_at(pc)
            .into_iter()
            .map(|call| InlineRecord {
                function: self
                    .lookup_func(&call.function)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(Function::new(call.function.clone(), 0, 0))),
                call_file: call.call_file.clone(),
                call_line: call.call_line,
            })
            .collect()
    }
}

impl TypeLookup for BinaryInfo
{
    /// Resolve a type name, building pointer types for a leading `*`.
    fn find_type(&self, name: &str) -> QuarryResult<TypeId>
    {
        let name = name.trim();
        if let Some(pointee) = name.strip_prefix('*') {
            let pointee = self.find_type(pointee)?;
            return Ok(self.types.pointer_to(pointee));
        }
        self.types
            .by_name(name)
            .ok_or_else(|| QuarryError::SymbolNotFound(format!("type {name}")))
    }
}

impl fmt::Debug for BinaryInfo
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("BinaryInfo")
            .field("architecture", &self.architecture)
            .field("functions", &self.functions.len())
            .field("line_tables", &self.line_tables.len())
            .field("package_vars", &self.package_vars.len())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`BinaryInfo`] piece by piece
///
/// Used by the object file loader and by embedders that describe a program
/// some other way (a JIT, a test fixture).
///
/// ```rust
/// use quarry_core::binary::{BinaryInfoBuilder, Function};
/// use quarry_core::types::Architecture;
///
/// let bi = BinaryInfoBuilder::new(Architecture::X86_64)
///     .function(Function::new("main.main", 0x1000, 0x1080))
///     .build();
/// assert_eq!(bi.pc_to_func(0x1010).unwrap().name, "main.main");
/// ```
pub struct BinaryInfoBuilder
{
    architecture: Architecture,
    functions: Vec<Function>,
    line_tables: Vec<Arc<LineTable>>,
    types: TypeTable,
    package_vars: Vec<VariableEntry>,
    constants: HashMap<TypeId, Vec<ConstantValue>>,
    runtime_types: HashMap<u64, String>,
    frames: Box<dyn FrameDescriptionLookup>,
}

impl BinaryInfoBuilder
{
    pub fn new(architecture: Architecture) -> Self
    {
        Self {
            architecture,
            functions: Vec::new(),
            line_tables: Vec::new(),
            types: TypeTable::new(architecture.pointer_size()),
            package_vars: Vec::new(),
            constants: HashMap::new(),
            runtime_types: HashMap::new(),
            frames: Box::new(FrameTable::new()),
        }
    }

    /// The type table, for describing types before adding the things that
    /// use them.
    pub fn types(&self) -> &TypeTable
    {
        &self.types
    }

    #[must_use]
    pub fn function(mut self, function: Function) -> Self
    {
        self.functions.push(function);
        self
    }

    pub fn add_function(&mut self, function: Function)
    {
        self.functions.push(function);
    }

    /// Register a compilation unit's line table. Tables attached to added
    /// functions are registered automatically.
    #[must_use]
    pub fn line_table(mut self, table: Arc<LineTable>) -> Self
    {
        self.add_line_table(table);
        self
    }

    pub fn add_line_table(&mut self, table: Arc<LineTable>)
    {
        if !self.line_tables.iter().any(|known| Arc::ptr_eq(known, &table)) {
            self.line_tables.push(table);
        }
    }

    #[must_use]
    pub fn package_variable(mut self, variable: VariableEntry) -> Self
    {
        self.package_vars.push(variable);
        self
    }

    /// Declare the constant `full_name` (`pkg.Name`) of type `ty`.
    #[must_use]
    pub fn constant(mut self, ty: TypeId, full_name: &str, value: i64) -> Self
    {
        let name = full_name
            .rsplit_once('.')
            .map_or(full_name, |(_, name)| name)
            .to_string();
        let values = self.constants.entry(ty).or_default();
        values.push(ConstantValue {
            name,
            full_name: full_name.to_string(),
            value,
            single_bit: value != 0 && value & (value - 1) == 0,
        });
        values.sort_by_key(|constant| constant.value);
        self
    }

    /// Name the runtime type descriptor at `address`.
    #[must_use]
    pub fn runtime_type(mut self, address: u64, name: &str) -> Self
    {
        self.runtime_types.insert(address, name.to_string());
        self
    }

    #[must_use]
    pub fn frames(mut self, frames: impl FrameDescriptionLookup + 'static) -> Self
    {
        self.frames = Box::new(frames);
        self
    }

    pub fn build(mut self) -> BinaryInfo
    {
        for table in self.functions.iter().filter_map(|function| function.line_table.clone()) {
            if !self.line_tables.iter().any(|known| Arc::ptr_eq(known, &table)) {
                self.line_tables.push(table);
            }
        }
        self.functions.sort_by_key(|function| function.entry);
        let functions: Vec<Arc<Function>> = self.functions.into_iter().map(Arc::new).collect();
        let functions_by_name = functions
            .iter()
            .map(|function| (function.name.clone(), Arc::clone(function)))
            .collect();
        debug!(
            functions = functions.len(),
            line_tables = self.line_tables.len(),
            "built binary info"
        );
        BinaryInfo {
            architecture: self.architecture,
            functions,
            functions_by_name,
            line_tables: self.line_tables,
            types: self.types,
            package_vars: self.package_vars,
            constants: self.constants,
            runtime_types: self.runtime_types,
            frames: self.frames,
        }
    }
}

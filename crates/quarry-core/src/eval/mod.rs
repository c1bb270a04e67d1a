//! # Value Reconstruction
//!
//! Turns bytes in the debuggee's address space into typed, named values.
//!
//! A [`Variable`] pairs an address with a type from the binary's type graph.
//! Creating one reads only the header of dynamically sized kinds (strings,
//! slices, channels); everything else is read by a single load pass bounded
//! by a [`LoadConfig`]. Read failures never abort a load: the variable that
//! could not be read is marked unreadable, loses its children, and its
//! siblings carry on.
//!
//! ## Contents
//!
//! - [`Variable`] and the load engine, one loader per [`Kind`]
//! - [`MapIterator`]: walks hash table buckets, including tables caught in
//!   the middle of a resize
//! - [`EvalScope`]: locals, arguments, package variables, expression
//!   evaluation and assignment at one program counter
//! - [`parse_expression`]: the expression grammar
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use quarry_core::binary::{BinaryInfoBuilder, TypeKind};
//! use quarry_core::eval::{Kind, LoadConfig, Value, Variable};
//! use quarry_core::memory::{Memory, SnapshotMemory};
//! use quarry_core::types::{Address, Architecture};
//!
//! let builder = BinaryInfoBuilder::new(Architecture::X86_64);
//! let int = builder.types().basic("int", 8, TypeKind::Int);
//! let bi = Arc::new(builder.build());
//! let mem: Memory = Arc::new(SnapshotMemory::new().with_region(Address::new(0x1000), 42i64.to_le_bytes().to_vec()));
//!
//! let mut answer = Variable::new("answer", Address::new(0x1000), int, mem, bi);
//! answer.load_value(&LoadConfig::full_value());
//! assert_eq!(answer.kind, Kind::Int);
//! assert_eq!(answer.value, Some(Value::Int(42)));
//! ```

mod access;
mod constant;
mod interface;
mod map;
mod parser;
mod scope;
mod variable;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

pub use map::MapIterator;
pub use parser::{parse_expression, Expr};
pub use scope::EvalScope;
pub use variable::Variable;

/// Per-element read failures tolerated inside one container before the
/// rest of it is abandoned.
pub const MAX_ERR_COUNT: usize = 3;

/// Containers whose elements are smaller than this are read in one go.
pub const MAX_ARRAY_STRIDE_PREFETCH: i64 = 1024;

/// Budgets for one load pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadConfig
{
    /// Load the target of pointers instead of only their address
    pub follow_pointers: bool,
    /// Nested aggregate levels to expand; pointers do not count except
    /// when they lead to an interface
    pub max_variable_recurse: i32,
    /// Bytes of string data to read
    pub max_string_len: usize,
    /// Elements of arrays, slices, channels and maps to read
    pub max_array_values: usize,
    /// Struct fields to read, negative for all of them
    pub max_struct_fields: i32,
}

impl LoadConfig
{
    /// Only the value itself: no children.
    pub const fn single_value() -> Self
    {
        Self {
            follow_pointers: false,
            max_variable_recurse: 0,
            max_string_len: 64,
            max_array_values: 0,
            max_struct_fields: 0,
        }
    }

    /// One level of children, pointers followed.
    pub const fn full_value() -> Self
    {
        Self {
            follow_pointers: true,
            max_variable_recurse: 1,
            max_string_len: 64,
            max_array_values: 64,
            max_struct_fields: -1,
        }
    }
}

impl Default for LoadConfig
{
    fn default() -> Self
    {
        Self::full_value()
    }
}

/// Shape of a value, after typedefs are stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Kind
{
    #[default]
    Invalid,
    Bool,
    Int,
    Uint,
    Float32,
    Float64,
    Complex64,
    Complex128,
    String,
    Ptr,
    UnsafePointer,
    Array,
    Slice,
    Struct,
    Interface,
    Map,
    Chan,
    Func,
}

impl Kind
{
    pub fn is_integer(self) -> bool
    {
        matches!(self, Kind::Int | Kind::Uint)
    }

    pub fn is_float(self) -> bool
    {
        matches!(self, Kind::Float32 | Kind::Float64)
    }

    pub fn is_complex(self) -> bool
    {
        matches!(self, Kind::Complex64 | Kind::Complex128)
    }
}

impl fmt::Display for Kind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            Kind::Invalid => "invalid",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Uint => "uint",
            Kind::Float32 => "float32",
            Kind::Float64 => "float64",
            Kind::Complex64 => "complex64",
            Kind::Complex128 => "complex128",
            Kind::String => "string",
            Kind::Ptr => "ptr",
            Kind::UnsafePointer => "unsafe.Pointer",
            Kind::Array => "array",
            Kind::Slice => "slice",
            Kind::Struct => "struct",
            Kind::Interface => "interface",
            Kind::Map => "map",
            Kind::Chan => "chan",
            Kind::Func => "func",
        };
        f.write_str(name)
    }
}

/// A scalar read out of memory or written in an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value
{
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(f64, f64),
    String(String),
}

impl Value
{
    /// The value as a signed integer; unsigned values wrap.
    pub fn as_i64(&self) -> Option<i64>
    {
        match self {
            Value::Int(n) => Some(*n),
            Value::Uint(n) => Some(*n as i64),
            _ => None,
        }
    }

    /// The value as an unsigned integer; signed values wrap.
    pub fn as_u64(&self) -> Option<u64>
    {
        match self {
            Value::Int(n) => Some(*n as u64),
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64>
    {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Uint(n) => Some(*n as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    /// Real and imaginary parts of any numeric value.
    pub fn as_complex(&self) -> Option<(f64, f64)>
    {
        match self {
            Value::Complex(real, imag) => Some((*real, *imag)),
            other => other.as_f64().map(|real| (real, 0.0)),
        }
    }

    pub fn as_bool(&self) -> Option<bool>
    {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str>
    {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Equality across numeric representations: `Int(1)` equals `Uint(1)`
    /// and `Float(1.0)`.
    #[allow(clippy::float_cmp)]
    pub fn loosely_equals(&self, other: &Value) -> bool
    {
        match (self, other) {
            (Value::Int(a), Value::Uint(b)) | (Value::Uint(b), Value::Int(a)) => *a >= 0 && *a as u64 == *b,
            (Value::Float(_) | Value::Complex(..), _) | (_, Value::Float(_) | Value::Complex(..)) => {
                match (self.as_complex(), other.as_complex()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Uint(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Complex(real, imag) => write!(f, "({real} + {imag}i)"),
            Value::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// Floating point values that have no literal representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatSpecial
{
    #[default]
    Normal,
    NaN,
    PosInf,
    NegInf,
}

/// What a variable is to its scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VariableFlags(u16);

impl VariableFlags
{
    /// Heap-allocated local, reached through a hidden pointer
    pub const ESCAPED: Self = Self(1);
    /// Hidden by a variable of the same name in an inner block
    pub const SHADOWED: Self = Self(1 << 1);
    pub const CONSTANT: Self = Self(1 << 2);
    pub const ARGUMENT: Self = Self(1 << 3);
    pub const RETURN_ARGUMENT: Self = Self(1 << 4);

    pub const fn empty() -> Self
    {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool
    {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool
    {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self)
    {
        self.0 |= other.0;
    }
}

impl BitOr for VariableFlags
{
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self
    {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for VariableFlags
{
    fn bitor_assign(&mut self, rhs: Self)
    {
        self.insert(rhs);
    }
}

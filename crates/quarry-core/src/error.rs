//! # Error Types
//!
//! Error handling for line lookups, unwinding and value reconstruction.
//!
//! We use `thiserror` to generate the `Error` implementations. The enum is
//! `Clone` because errors are not only returned: a poisoned [`Variable`] or the
//! sentinel frame at the end of a failed stack walk keeps a copy of the error
//! that stopped it.
//!
//! ## Error Categories
//!
//! 1. **Read failures**: `MemoryRead`, `MemoryWrite`, `Unreadable`
//! 2. **Unwind metadata**: `NoFrameDescription`, `UndefinedCfa`,
//!    `UndefinedReturnAddress`, `NullAddress`, `StackBarrier`
//! 3. **Debug information corruption**: `MalformedType`, `NegativeLength`
//! 4. **Contract violations**: `NegativeDepth`, `NoFunctionContext`
//! 5. **Evaluation**: `SymbolNotFound`, `NotAddressable`, `TypeMismatch`, `Parse`
//!
//! [`Variable`]: crate::eval::Variable

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for debug information and target memory operations
#[derive(Error, Debug, Clone)]
pub enum QuarryError
{
    /// Reading target memory failed
    ///
    /// The memory collaborator could not supply the requested bytes, either
    /// because the range is unmapped or the process is gone.
    #[error("could not read {size} bytes at 0x{address:x}: {reason}")]
    MemoryRead
    {
        /// First address of the failed read
        address: u64,
        /// Number of bytes requested
        size: usize,
        /// Collaborator-supplied detail
        reason: String,
    },

    /// Writing target memory failed
    #[error("could not write {size} bytes at 0x{address:x}: {reason}")]
    MemoryWrite
    {
        /// First address of the failed write
        address: u64,
        /// Number of bytes offered
        size: usize,
        /// Collaborator-supplied detail
        reason: String,
    },

    /// A return address was read from address zero
    #[error("NULL address")]
    NullAddress,

    /// No frame description entry covers the program counter
    ///
    /// Not fatal during unwinding: the architecture default rules are used.
    #[error("could not find FDE for PC 0x{0:x}")]
    NoFrameDescription(u64),

    /// The canonical frame address rule evaluated to nothing
    #[error("CFA becomes undefined at PC 0x{0:x}")]
    UndefinedCfa(u64),

    /// The return address register has no recovery rule result
    #[error("undefined return address at PC 0x{0:x}")]
    UndefinedReturnAddress(u64),

    /// A register rule or DWARF operation this crate cannot evaluate
    #[error("unsupported DWARF operation: {0}")]
    Unsupported(String),

    /// A register needed by an expression is not in the register set
    #[error("register {0} is not available")]
    RegisterUnavailable(u16),

    /// The thread stopped inside the stack barrier trampoline and the saved
    /// return address records do not say which frame it belongs to
    #[error("failed to unwind through stackBarrier at SP 0x{0:x}")]
    StackBarrier(u64),

    /// Negative maximum stack depth passed to a stack trace request
    #[error("negative maximum stack depth")]
    NegativeDepth,

    /// Evaluation requested against a scope without a function
    #[error("unable to find function context")]
    NoFunctionContext,

    /// A type in the type graph does not have the shape its kind promises
    #[error("malformed type: {0}")]
    MalformedType(String),

    /// A length or capacity read from memory is negative
    #[error("negative {what} length {value}")]
    NegativeLength
    {
        /// Which container the length belongs to
        what: &'static str,
        /// The raw value read
        value: i64,
    },

    /// An identifier resolved to nothing in the current scope
    #[error("could not find symbol value for {0}")]
    SymbolNotFound(String),

    /// The variable has no location at the current program counter
    #[error("{0} has been optimized out")]
    OptimizedOut(String),

    /// Assignment target has no backing address
    #[error("can not assign to \"{0}\"")]
    NotAddressable(String),

    /// Operation on a value whose load failed
    #[error("{name} is unreadable: {reason}")]
    Unreadable
    {
        /// Name of the poisoned value
        name: String,
        /// The error that poisoned it
        reason: Box<QuarryError>,
    },

    /// Kinds or types of two values are incompatible
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Dereference of a nil pointer, map, or interface
    #[error("{0} is nil")]
    Nil(String),

    /// Index or field access that does not apply to the value
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// Malformed expression text
    #[error("parse error at offset {offset}: {message}")]
    Parse
    {
        /// Byte offset into the expression source
        offset: usize,
        /// What was expected
        message: String,
    },

    /// Invalid argument passed to a public operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Error surfaced by the DWARF parser
    #[error("DWARF error while {context}: {source}")]
    Dwarf
    {
        /// What was being parsed
        context: String,
        /// Underlying gimli error
        source: gimli::Error,
    },

    /// Error reading an object file
    #[error("object file error: {0}")]
    Object(String),

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for QuarryError
{
    fn from(err: io::Error) -> Self
    {
        QuarryError::Io(Arc::new(err))
    }
}

impl QuarryError
{
    /// Wrap a gimli error with a description of the parse step that failed.
    pub(crate) fn dwarf(context: impl Into<String>, source: gimli::Error) -> Self
    {
        QuarryError::Dwarf {
            context: context.into(),
            source,
        }
    }

    /// Report `self` as the reason `name` could not be used.
    pub(crate) fn unreadable(name: impl Into<String>, reason: &QuarryError) -> Self
    {
        QuarryError::Unreadable {
            name: name.into(),
            reason: Box::new(reason.clone()),
        }
    }

    /// Whether this error only signals missing unwind metadata.
    #[must_use]
    pub fn is_missing_frame_description(&self) -> bool
    {
        matches!(self, QuarryError::NoFrameDescription(_))
    }
}

pub type QuarryResult<T> = std::result::Result<T, QuarryError>;

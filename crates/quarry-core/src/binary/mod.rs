//! # Binary Debug Information
//!
//! The static side of debugging: what the compiler recorded about the
//! program, independent of any running process.
//!
//! ## Contents
//!
//! - [`BinaryInfo`]: functions, line tables, types, package variables,
//!   constants and frame descriptions of one executable
//! - [`BinaryInfoBuilder`]: assembles a `BinaryInfo` by hand
//! - [`BinaryInfo::load`]: reads one from an ELF or Mach-O file
//! - [`TypeTable`]: the type graph, with constructors for the runtime's
//!   string, slice, map, channel and interface layouts
//! - [`InlineLookup`] and [`TypeLookup`]: the narrow views the unwinder and
//!   the value engine depend on
//!
//! ## Example
//!
//! ```rust
//! use quarry_core::binary::{BinaryInfoBuilder, Function, TypeLookup};
//! use quarry_core::types::Architecture;
//!
//! let builder = BinaryInfoBuilder::new(Architecture::X86_64);
//! let string = builder.types().string_type();
//! let bi = builder.function(Function::new("main.main", 0x1000, 0x1100)).build();
//!
//! assert_eq!(bi.find_type("string").unwrap(), string);
//! assert!(bi.lookup_func("main.main").is_some());
//! ```

mod function;
mod info;
mod layout;
mod loader;
mod types;

pub use function::{
    Function, InlinedCall, LexicalBlock, LocationDescription, LocationListEntry, VariableEntry, VariableRole,
};
pub use info::{BinaryInfo, BinaryInfoBuilder, ConstantValue, InlineLookup, InlineRecord, TypeLookup};
pub use layout::BUCKET_SIZE;
pub use types::{StructField, Type, TypeId, TypeKind, TypeTable};

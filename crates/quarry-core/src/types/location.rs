//! Source positions.

use std::fmt;
use std::sync::Arc;

use super::Address;
use crate::binary::Function;

/// File name reported for addresses without line information.
pub const UNKNOWN_FILE: &str = "?";

/// An address resolved to a source position
///
/// Produced by line-table lookups and copied into frames. `function` is
/// `None` when the address lies outside every known function.
#[derive(Debug, Clone, PartialEq)]
pub struct Location
{
    pub pc: Address,
    pub file: String,
    pub line: Option<u32>,
    pub function: Option<Arc<Function>>,
}

impl Location
{
    /// A location for an address the binary knows nothing about.
    pub fn unknown(pc: Address) -> Self
    {
        Self {
            pc,
            file: UNKNOWN_FILE.to_string(),
            line: None,
            function: None,
        }
    }

    /// Name of the owning function, if any.
    pub fn function_name(&self) -> Option<&str>
    {
        self.function.as_deref().map(|function| function.name.as_str())
    }
}

impl Default for Location
{
    fn default() -> Self
    {
        Self::unknown(Address::ZERO)
    }
}

impl fmt::Display for Location
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = self.function_name().unwrap_or("?");
        match self.line {
            Some(line) => write!(f, "{name} at {}:{line} ({})", self.file, self.pc),
            None => write!(f, "{name} at {} ({})", self.file, self.pc),
        }
    }
}

//! Target address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Absolute linear address in the debuggee's address space
///
/// Variables, frames and return-address slots all carry addresses in the
/// target, never in the debugger. Keeping them in a newtype stops sizes,
/// strides and register values from being passed where an address is meant.
///
/// Arithmetic wraps: unwinding frequently applies signed CFA offsets to values
/// read out of a possibly corrupt stack, and a wrapped address simply fails the
/// next memory read instead of panicking.
///
/// ## Example
///
/// ```rust
/// use quarry_core::types::Address;
///
/// let slot = Address::from(0xc000_0100);
/// assert_eq!(slot.offset(-8).value(), 0xc000_00f8);
/// assert_eq!((slot + 0x10).value(), 0xc000_0110);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address, also used as "no backing storage"
    pub const ZERO: Self = Address(0);

    /// Create an address in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Raw value, for handing to the memory collaborator.
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Whether this is the null address.
    pub const fn is_null(self) -> bool
    {
        self.0 == 0
    }

    /// Apply a signed displacement, wrapping on overflow.
    ///
    /// ```rust
    /// use quarry_core::types::Address;
    ///
    /// let cfa = Address::new(0x1000);
    /// assert_eq!(cfa.offset(-16), Address::new(0xff0));
    /// ```
    #[must_use]
    pub const fn offset(self, delta: i64) -> Self
    {
        Address(self.0.wrapping_add_signed(delta))
    }

    /// Add an offset to this address, checking for overflow
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}

//! # Target Memory Access
//!
//! The core never talks to a process directly. Every byte it needs comes
//! through a [`MemoryReadWriter`] supplied by the process-control layer, and
//! every write goes back through it.
//!
//! On top of that trait this module provides:
//!
//! - [`CachedMemory`]: a window that is read once, used when loading arrays
//!   and frames so that many small reads become one large one.
//! - [`CompositeMemory`]: a variable split across registers and memory
//!   (DWARF pieces) assembled into a contiguous buffer at a fake address.
//! - [`SnapshotMemory`]: memory regions held in the debugger itself, as
//!   produced by a core file loader or a test fixture.
//! - Little-endian integer helpers ([`read_uint`], [`read_int`]).

use std::fmt;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::error::{QuarryError, QuarryResult};
use crate::frame::{Piece, PieceLocation};
use crate::types::{Address, DwarfRegisters};

/// Address at which composite (register-assembled) values are exposed.
pub const FAKE_ADDRESS: Address = Address::new(0xbeef_0000);

/// Windows larger than this are never cached.
pub const MAX_CACHEABLE_SIZE: usize = 1024 * 1024;

/// Byte-level access to the debuggee's address space
///
/// Implementations should return errors rather than panic on unmapped
/// addresses. A successful read may be short; callers that need every byte
/// go through [`read_exact`].
///
/// Writes take `&self` because the memory handle is shared by every value
/// loaded from it; implementations use interior mutability (or a system call)
/// for the write itself.
pub trait MemoryReadWriter: Send + Sync
{
    /// Read up to `buf.len()` bytes starting at `address`.
    fn read_memory(&self, buf: &mut [u8], address: Address) -> QuarryResult<usize>;

    /// Write `data` starting at `address`.
    fn write_memory(&self, address: Address, data: &[u8]) -> QuarryResult<usize>;

    /// The memory that backs this one, when this memory only fabricates
    /// addresses (composite values). Pointers read out of such memory point
    /// into the real address space.
    fn real_memory(&self) -> Option<Memory>
    {
        None
    }
}

/// Shared handle to target memory.
pub type Memory = Arc<dyn MemoryReadWriter>;

/// Memory to use when following a pointer read out of `mem`.
pub fn dereference_memory(mem: &Memory) -> Memory
{
    mem.real_memory().unwrap_or_else(|| Arc::clone(mem))
}

/// Read exactly `buf.len()` bytes or fail.
pub fn read_exact(mem: &dyn MemoryReadWriter, address: Address, buf: &mut [u8]) -> QuarryResult<()>
{
    let read = mem.read_memory(buf, address)?;
    if read < buf.len() {
        return Err(QuarryError::MemoryRead {
            address: address.value(),
            size: buf.len(),
            reason: format!("short read of {read} bytes"),
        });
    }
    Ok(())
}

/// Read a little-endian unsigned integer of `size` bytes (at most 8).
pub fn read_uint(mem: &dyn MemoryReadWriter, address: Address, size: usize) -> QuarryResult<u64>
{
    if size == 0 || size > 8 {
        return Err(QuarryError::InvalidArgument(format!("cannot read a {size}-byte integer")));
    }
    let mut bytes = [0u8; 8];
    read_exact(mem, address, &mut bytes[..size])?;
    Ok(u64::from_le_bytes(bytes))
}

/// Read a little-endian signed integer of `size` bytes (at most 8),
/// sign-extending it.
pub fn read_int(mem: &dyn MemoryReadWriter, address: Address, size: usize) -> QuarryResult<i64>
{
    let raw = read_uint(mem, address, size)?;
    let shift = 64 - 8 * size as u32;
    Ok(((raw << shift) as i64) >> shift)
}

/// Read `[address, address + size)` once and serve later reads inside it
/// from the copy.
///
/// Returns `mem` itself when the window is empty, too large to be worth it,
/// or not entirely readable. In the last case every read goes to `mem`, so
/// only the values that overlap the unmapped bytes fail.
pub fn cache_memory(mem: &Memory, address: Address, size: usize) -> Memory
{
    if size == 0 || size > MAX_CACHEABLE_SIZE {
        return Arc::clone(mem);
    }
    let mut data = vec![0u8; size];
    if let Err(err) = read_exact(mem.as_ref(), address, &mut data) {
        trace!(%address, size, %err, "window not cached");
        return Arc::clone(mem);
    }
    Arc::new(CachedMemory {
        inner: Arc::clone(mem),
        base: address,
        data,
    })
}

/// A memory window fetched up front and then served locally
///
/// Reads that fall entirely inside the window never reach the collaborator
/// again; everything else passes through. Writes always pass through and do
/// not refresh the window: a cache lives for a single load pass.
pub struct CachedMemory
{
    inner: Memory,
    base: Address,
    data: Vec<u8>,
}

impl CachedMemory
{
    fn contains(&self, address: Address, len: usize) -> bool
    {
        address >= self.base
            && (address.value() - self.base.value())
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.data.len() as u64)
    }
}

impl MemoryReadWriter for CachedMemory
{
    fn read_memory(&self, buf: &mut [u8], address: Address) -> QuarryResult<usize>
    {
        if !self.contains(address, buf.len()) {
            return self.inner.read_memory(buf, address);
        }
        let start = (address.value() - self.base.value()) as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> QuarryResult<usize>
    {
        self.inner.write_memory(address, data)
    }

    fn real_memory(&self) -> Option<Memory>
    {
        self.inner.real_memory()
    }
}

/// A value assembled from DWARF pieces
///
/// Optimized code can keep parts of one variable in different registers or
/// split between a register and a stack slot. The pieces are concatenated into
/// one buffer exposed at [`FAKE_ADDRESS`], so the value engine can load the
/// variable exactly as if it lived in memory.
pub struct CompositeMemory
{
    real: Memory,
    base: Address,
    data: Vec<u8>,
}

impl CompositeMemory
{
    /// Assemble `pieces`, reading register pieces from `regs` and memory
    /// pieces from `real`.
    pub fn new(real: Memory, regs: &DwarfRegisters, pieces: &[Piece]) -> QuarryResult<Self>
    {
        let mut data = Vec::new();
        for piece in pieces {
            match &piece.location {
                PieceLocation::Register(number) => {
                    let bytes = regs
                        .reg_bytes(*number)
                        .ok_or(QuarryError::RegisterUnavailable(*number))?;
                    let size = if piece.size == 0 { bytes.len() } else { piece.size.min(bytes.len()) };
                    data.extend_from_slice(&bytes[..size]);
                }
                PieceLocation::Address(address) => {
                    let mut buf = vec![0u8; piece.size];
                    read_exact(real.as_ref(), Address::new(*address), &mut buf)?;
                    data.extend_from_slice(&buf);
                }
                PieceLocation::Value(value) => {
                    let bytes = value.to_le_bytes();
                    let size = if piece.size == 0 { bytes.len() } else { piece.size.min(bytes.len()) };
                    data.extend_from_slice(&bytes[..size]);
                }
                PieceLocation::Bytes(bytes) => data.extend_from_slice(bytes),
                PieceLocation::Empty => data.resize(data.len() + piece.size, 0),
            }
        }
        Ok(Self {
            real,
            base: FAKE_ADDRESS,
            data,
        })
    }

    /// Address the assembled value is exposed at.
    pub fn base(&self) -> Address
    {
        self.base
    }
}

impl MemoryReadWriter for CompositeMemory
{
    fn read_memory(&self, buf: &mut [u8], address: Address) -> QuarryResult<usize>
    {
        let start = address.value().wrapping_sub(self.base.value()) as usize;
        match self.data.get(start..start.saturating_add(buf.len())) {
            Some(bytes) if address >= self.base => {
                buf.copy_from_slice(bytes);
                Ok(buf.len())
            }
            _ => Err(QuarryError::MemoryRead {
                address: address.value(),
                size: buf.len(),
                reason: "outside composite value".into(),
            }),
        }
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> QuarryResult<usize>
    {
        Err(QuarryError::MemoryWrite {
            address: address.value(),
            size: data.len(),
            reason: "can't write composite memory".into(),
        })
    }

    fn real_memory(&self) -> Option<Memory>
    {
        Some(Arc::clone(&self.real))
    }
}

/// Memory regions held by the debugger
///
/// Serves reads and writes from owned byte buffers, one per mapped region.
/// Reads that touch an unmapped byte fail as a whole.
#[derive(Default)]
pub struct SnapshotMemory
{
    regions: RwLock<Vec<(Address, Vec<u8>)>>,
}

impl SnapshotMemory
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Map `bytes` at `base`, replacing nothing.
    pub fn map(&self, base: Address, bytes: Vec<u8>)
    {
        if let Ok(mut regions) = self.regions.write() {
            regions.push((base, bytes));
        }
    }

    /// Builder form of [`SnapshotMemory::map`].
    #[must_use]
    pub fn with_region(self, base: Address, bytes: Vec<u8>) -> Self
    {
        self.map(base, bytes);
        self
    }

    fn locate(regions: &[(Address, Vec<u8>)], address: Address, len: usize) -> Option<(usize, usize)>
    {
        regions.iter().enumerate().find_map(|(index, (base, bytes))| {
            let start = address.value().checked_sub(base.value())? as usize;
            (start.checked_add(len)? <= bytes.len()).then_some((index, start))
        })
    }
}

impl MemoryReadWriter for SnapshotMemory
{
    fn read_memory(&self, buf: &mut [u8], address: Address) -> QuarryResult<usize>
    {
        let regions = self.regions.read().map_err(|_| QuarryError::MemoryRead {
            address: address.value(),
            size: buf.len(),
            reason: "snapshot lock poisoned".into(),
        })?;
        let (index, start) = Self::locate(&regions, address, buf.len()).ok_or_else(|| QuarryError::MemoryRead {
            address: address.value(),
            size: buf.len(),
            reason: "unmapped".into(),
        })?;
        buf.copy_from_slice(&regions[index].1[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> QuarryResult<usize>
    {
        let mut regions = self.regions.write().map_err(|_| QuarryError::MemoryWrite {
            address: address.value(),
            size: data.len(),
            reason: "snapshot lock poisoned".into(),
        })?;
        let (index, start) = Self::locate(&regions, address, data.len()).ok_or_else(|| QuarryError::MemoryWrite {
            address: address.value(),
            size: data.len(),
            reason: "unmapped".into(),
        })?;
        regions[index].1[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

impl fmt::Debug for SnapshotMemory
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let regions = self.regions.read().map(|regions| {
            regions
                .iter()
                .map(|(base, bytes)| (*base, bytes.len()))
                .collect::<Vec<_>>()
        });
        f.debug_struct("SnapshotMemory").field("regions", &regions.ok()).finish()
    }
}

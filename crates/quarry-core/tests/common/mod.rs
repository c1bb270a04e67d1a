//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use quarry_core::error::{QuarryError, QuarryResult};
use quarry_core::memory::{Memory, MemoryReadWriter};
use quarry_core::types::Address;
use quarry_utils::{init_logging_with_level, LogFormat, LogLevel};

/// Route the core crate's trace events to the test output. Only the first
/// call in a test binary installs the subscriber.
pub fn init_tracing()
{
    let _ = init_logging_with_level(LogLevel::Trace, LogFormat::Pretty);
}

/// Little-endian bytes of each word.
pub fn words(values: &[u64]) -> Vec<u8>
{
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Memory made of fixed regions. Every write is recorded, then applied to
/// the region holding it.
#[derive(Default)]
pub struct FakeMemory
{
    regions: Mutex<Vec<(u64, Vec<u8>)>>,
    writes: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl FakeMemory
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with(self, base: u64, bytes: Vec<u8>) -> Self
    {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((base, bytes));
        self
    }

    pub fn with_words(self, base: u64, values: &[u64]) -> Self
    {
        self.with(base, words(values))
    }

    pub fn writes(&self) -> Vec<(u64, Vec<u8>)>
    {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn shared(self) -> (Arc<FakeMemory>, Memory)
    {
        let fake = Arc::new(self);
        let mem: Memory = fake.clone();
        (fake, mem)
    }
}

impl MemoryReadWriter for FakeMemory
{
    fn read_memory(&self, buf: &mut [u8], address: Address) -> QuarryResult<usize>
    {
        let regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        for (base, bytes) in regions.iter() {
            let Some(start) = address.value().checked_sub(*base) else {
                continue;
            };
            let start = start as usize;
            if start + buf.len() <= bytes.len() {
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return Ok(buf.len());
            }
        }
        Err(QuarryError::MemoryRead {
            address: address.value(),
            size: buf.len(),
            reason: "unmapped".into(),
        })
    }

    fn write_memory(&self, address: Address, data: &[u8]) -> QuarryResult<usize>
    {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((address.value(), data.to_vec()));

        let mut regions = self.regions.lock().unwrap_or_else(PoisonError::into_inner);
        for (base, bytes) in regions.iter_mut() {
            let Some(start) = address.value().checked_sub(*base) else {
                continue;
            };
            let start = start as usize;
            if start + data.len() <= bytes.len() {
                bytes[start..start + data.len()].copy_from_slice(data);
                return Ok(data.len());
            }
        }
        Err(QuarryError::MemoryWrite {
            address: address.value(),
            size: data.len(),
            reason: "unmapped".into(),
        })
    }
}

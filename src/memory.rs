//! Checked access to the memory of the unwound program.
//!
//! Stack contents and module images are untrusted: every read goes through
//! [`Memory::is_readable`] first and a failed probe becomes
//! [`UnwindError::UnreadableMemory`] instead of a fault.

use alloc::{vec, vec::Vec};

use crate::error::{Result, UnwindError};

pub trait Memory {
    /// Memory validity probe: can `len` bytes at `address` be read?
    fn is_readable(&self, address: u64, len: usize) -> bool;

    /// Copies `buf.len()` bytes from `address`. Only called after a
    /// successful probe; returns `false` if the copy failed anyway.
    fn read_raw(&self, address: u64, buf: &mut [u8]) -> bool;

    fn read_bytes(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let unreadable = UnwindError::UnreadableMemory {
            address,
            len: buf.len(),
        };
        if address.checked_add(buf.len() as u64).is_none() || !self.is_readable(address, buf.len())
        {
            trace!("probe failed for {:#x}+{:#x}", address, buf.len());
            return Err(unreadable);
        }
        if !self.read_raw(address, buf) {
            return Err(unreadable);
        }
        Ok(())
    }

    fn read_vec(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_bytes(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_bytes(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buf = [0; 8];
        self.read_bytes(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u128(&self, address: u64) -> Result<u128> {
        let mut buf = [0; 16];
        self.read_bytes(address, &mut buf)?;
        Ok(u128::from_le_bytes(buf))
    }
}

impl<M: Memory + ?Sized> Memory for &M {
    fn is_readable(&self, address: u64, len: usize) -> bool {
        (**self).is_readable(address, len)
    }

    fn read_raw(&self, address: u64, buf: &mut [u8]) -> bool {
        (**self).read_raw(address, buf)
    }
}

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn offset_of(&self, address: u64, len: usize) -> Option<usize> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        (offset.checked_add(len)? <= self.bytes.len()).then_some(offset)
    }
}

/// An address space made of owned byte regions. Anything outside a region
/// is unreadable, and a read may not straddle two regions.
///
/// This is how stacks and module images are modelled when there is no live
/// process behind them.
#[derive(Debug, Clone, Default)]
pub struct SyntheticMemory {
    regions: Vec<Region>,
}

impl SyntheticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`. Later mappings shadow earlier ones.
    pub fn map(&mut self, base: u64, bytes: impl Into<Vec<u8>>) -> &mut Self {
        self.regions.push(Region {
            base,
            bytes: bytes.into(),
        });
        self
    }

    /// Overwrites already mapped bytes. Returns `false` if the range is not
    /// mapped.
    pub fn write(&mut self, address: u64, data: &[u8]) -> bool {
        let Some(region) = self
            .regions
            .iter_mut()
            .rev()
            .find(|r| r.offset_of(address, data.len()).is_some())
        else {
            return false;
        };
        let offset = address as usize - region.base as usize;
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    pub fn write_u64(&mut self, address: u64, value: u64) -> bool {
        self.write(address, &value.to_le_bytes())
    }

    fn find(&self, address: u64, len: usize) -> Option<&[u8]> {
        self.regions.iter().rev().find_map(|region| {
            let offset = region.offset_of(address, len)?;
            Some(&region.bytes[offset..offset + len])
        })
    }
}

impl Memory for SyntheticMemory {
    fn is_readable(&self, address: u64, len: usize) -> bool {
        self.find(address, len).is_some()
    }

    fn read_raw(&self, address: u64, buf: &mut [u8]) -> bool {
        match self.find(address, buf.len()) {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }
}

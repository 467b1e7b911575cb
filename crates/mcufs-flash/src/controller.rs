//! Flash controller seam
//!
//! The board layer supplies a [`FlashController`]: reads come straight out
//! of the execute-in-place window, while program and erase must run with
//! every other execution context off the flash. A controller may achieve
//! that with a platform safe-execute primitive (parking other cores in
//! RAM, which can fail and is reported through [`FlashError`]) or by
//! disabling interrupts on single-core deployments.

use crate::error::{FlashError, Result};

/// Sector granularity of program/erase controllers (4 KiB)
pub const FLASH_SECTOR_SIZE: usize = 4096;

/// Page granularity of flash programming (256 bytes)
pub const FLASH_PAGE_SIZE: usize = 256;

/// Access to one on-chip flash bank.
///
/// Offsets are relative to the start of the flash bank. The caller
/// guarantees sector alignment for `erase` and page alignment for
/// `program`; controllers only need to bounds-check.
pub trait FlashController: Send {
    /// Size of the flash bank in bytes
    fn capacity(&self) -> usize;

    /// Copy out of the memory-mapped flash window.
    ///
    /// This is a plain load from XIP address space; implementations should
    /// not need to quiesce anything.
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Erase whole sectors covering `[offset, offset + len)`
    fn erase(&mut self, offset: usize, len: usize) -> Result<()>;

    /// Program previously erased flash with `data` at `offset`
    fn program(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

/// In-memory flash bank with NOR semantics, for tests and host
/// development: erase sets 0xFF, programming only clears bits.
pub struct RamFlash {
    data: Vec<u8>,
}

impl RamFlash {
    /// Create a bank of `capacity` bytes, fully erased
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0xFF; capacity],
        }
    }

    /// Raw view of the bank contents
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset + len > self.data.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(())
    }
}

impl FlashController for RamFlash {
    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        self.data[offset..offset + len].fill(0xFF);
        Ok(())
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // NOR programming can only clear bits
        for (cell, byte) in self.data[offset..offset + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        Ok(())
    }
}

//! Flash window block device

use log::trace;
use parking_lot::Mutex;

use mcufs_core::blockdevice::{BlockDevice, Geometry};
use mcufs_core::error::{Error, Result};

use crate::controller::{FlashController, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};

const DEVICE_NAME: &str = "flash";

/// Block device over a window `[start, start + length)` of on-chip flash.
///
/// Reads are direct loads from the XIP-mapped region, taken under the
/// device mutex to exclude concurrent programming. Program and erase are
/// delegated to the [`FlashController`], which is responsible for keeping
/// every other execution context off the flash while they run.
pub struct FlashDevice<C: FlashController> {
    start: usize,
    length: usize,
    controller: Mutex<C>,
}

impl<C: FlashController> FlashDevice<C> {
    /// Create a device over `[start, start + length)` of `controller`'s
    /// bank. Both `start` and `length` must be sector aligned; a `length`
    /// of zero extends the window to the end of flash. Misaligned or
    /// out-of-range windows are construction errors, never silently
    /// accepted.
    pub fn new(controller: C, start: usize, length: usize) -> Result<Self> {
        if start % FLASH_SECTOR_SIZE != 0 || length % FLASH_SECTOR_SIZE != 0 {
            return Err(Error::InvalidInput);
        }
        let capacity = controller.capacity();
        let length = if length == 0 {
            capacity.checked_sub(start).ok_or(Error::InvalidInput)?
        } else {
            length
        };
        if start + length > capacity {
            return Err(Error::InvalidInput);
        }
        Ok(Self {
            start,
            length,
            controller: Mutex::new(controller),
        })
    }

    fn check(&self, addr: u64, len: usize, aligned: bool) -> Result<()> {
        if !aligned || addr as usize + len > self.length {
            return Err(Error::InvalidInput);
        }
        Ok(())
    }
}

impl<C: FlashController> BlockDevice for FlashDevice<C> {
    fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            read_size: 1,
            program_size: FLASH_PAGE_SIZE,
            erase_size: FLASH_SECTOR_SIZE,
        }
    }

    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        self.check(addr, buf.len(), true)?;
        let mut controller = self.controller.lock();
        controller.read(self.start + addr as usize, buf)?;
        Ok(())
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, buf.len(), geometry.is_program_aligned(addr, buf.len()))?;
        trace!("flash: program {} bytes at {:#x}", buf.len(), addr);
        let mut controller = self.controller.lock();
        controller.program(self.start + addr as usize, buf)?;
        Ok(())
    }

    fn erase(&self, addr: u64, len: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, len as usize, geometry.is_erase_aligned(addr, len))?;
        trace!("flash: erase {} bytes at {:#x}", len, addr);
        let mut controller = self.controller.lock();
        controller.erase(self.start + addr as usize, len as usize)?;
        Ok(())
    }

    fn trim(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.length as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::RamFlash;
    use crate::error::FlashError;

    const BANK: usize = 64 * 1024;

    #[test]
    fn test_window_alignment_is_enforced_at_construction() {
        assert!(FlashDevice::new(RamFlash::new(BANK), 100, 0).is_err());
        assert!(FlashDevice::new(RamFlash::new(BANK), 0, 100).is_err());
        assert!(FlashDevice::new(RamFlash::new(BANK), BANK + 4096, 0).is_err());
        assert!(FlashDevice::new(RamFlash::new(BANK), 4096, 0).is_ok());
    }

    #[test]
    fn test_zero_length_extends_to_end() {
        let device = FlashDevice::new(RamFlash::new(BANK), 8192, 0).unwrap();
        assert_eq!(device.size(), (BANK - 8192) as u64);
    }

    #[test]
    fn test_window_offsets_are_applied() {
        let device = FlashDevice::new(RamFlash::new(BANK), 4096, 8192).unwrap();
        device.erase(0, 4096).unwrap();
        let page = [0x5Au8; FLASH_PAGE_SIZE];
        device.program(&page, 0).unwrap();

        let mut out = [0u8; FLASH_PAGE_SIZE];
        device.read(&mut out, 0).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn test_unaligned_program_rejected() {
        let device = FlashDevice::new(RamFlash::new(BANK), 0, 0).unwrap();
        let page = [0u8; FLASH_PAGE_SIZE];
        assert_eq!(device.program(&page, 100).unwrap_err(), Error::InvalidInput);
        assert_eq!(device.erase(256, 256).unwrap_err(), Error::InvalidInput);
    }

    #[test]
    fn test_byte_granular_reads() {
        let device = FlashDevice::new(RamFlash::new(BANK), 0, 0).unwrap();
        let mut one = [0u8; 1];
        device.read(&mut one, 13).unwrap();
        assert_eq!(one[0], 0xFF);
    }

    /// Controller whose program path fails like a safe-execute timeout
    struct StuckController(RamFlash);

    impl FlashController for StuckController {
        fn capacity(&self) -> usize {
            self.0.capacity()
        }
        fn read(&mut self, offset: usize, buf: &mut [u8]) -> crate::error::Result<()> {
            self.0.read(offset, buf)
        }
        fn erase(&mut self, _offset: usize, _len: usize) -> crate::error::Result<()> {
            Err(FlashError::Timeout)
        }
        fn program(&mut self, _offset: usize, _data: &[u8]) -> crate::error::Result<()> {
            Err(FlashError::NotPermitted)
        }
    }

    #[test]
    fn test_safe_execute_failures_are_distinct() {
        let device = FlashDevice::new(StuckController(RamFlash::new(BANK)), 0, 0).unwrap();
        assert_eq!(device.erase(0, 4096).unwrap_err(), Error::FlashTimeout);
        let page = [0u8; FLASH_PAGE_SIZE];
        assert_eq!(
            device.program(&page, 0).unwrap_err(),
            Error::FlashNotPermitted
        );
        assert_eq!(Error::FlashTimeout.code(), -4001);
    }
}

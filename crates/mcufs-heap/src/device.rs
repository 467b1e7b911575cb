//! RAM block device implementation

use log::trace;
use parking_lot::Mutex;

use mcufs_core::blockdevice::{BlockDevice, Geometry};
use mcufs_core::error::{Error, Result};

/// Block size reported for all three geometry values
pub const HEAP_BLOCK_SIZE: usize = 512;

/// Byte value a heap block holds after erase
pub const HEAP_ERASE_VALUE: u8 = 0xFF;

const DEVICE_NAME: &str = "heap";

/// Block device backed by a heap buffer.
///
/// The buffer is allocated on `init` rather than at construction, so a
/// deinit/init cycle hands back fresh, non-erased media - useful to
/// exercise mount-before-format failure paths.
pub struct HeapDevice {
    size: usize,
    buffer: Mutex<Option<Vec<u8>>>,
}

impl HeapDevice {
    /// Create a heap device of `size` bytes; `size` must be a positive
    /// multiple of [`HEAP_BLOCK_SIZE`].
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || size % HEAP_BLOCK_SIZE != 0 {
            return Err(Error::InvalidInput);
        }
        Ok(Self {
            size,
            buffer: Mutex::new(None),
        })
    }

    fn check(&self, addr: u64, len: usize, aligned: bool) -> Result<()> {
        if !aligned || addr as usize + len > self.size {
            return Err(Error::InvalidInput);
        }
        Ok(())
    }
}

impl BlockDevice for HeapDevice {
    fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    fn geometry(&self) -> Geometry {
        Geometry::uniform(HEAP_BLOCK_SIZE)
    }

    fn init(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.is_none() {
            trace!("heap: allocating {} bytes", self.size);
            let mut fresh = Vec::new();
            fresh
                .try_reserve_exact(self.size)
                .map_err(|_| Error::OutOfMemory)?;
            fresh.resize(self.size, 0);
            *buffer = Some(fresh);
        }
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        self.buffer.lock().take();
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.buffer.lock().is_some()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, buf.len(), geometry.is_read_aligned(addr, buf.len()))?;
        let guard = self.buffer.lock();
        let heap = guard.as_ref().ok_or(Error::NoDevice)?;
        let addr = addr as usize;
        buf.copy_from_slice(&heap[addr..addr + buf.len()]);
        Ok(())
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, buf.len(), geometry.is_program_aligned(addr, buf.len()))?;
        let mut guard = self.buffer.lock();
        let heap = guard.as_mut().ok_or(Error::NoDevice)?;
        let addr = addr as usize;
        heap[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&self, addr: u64, len: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, len as usize, geometry.is_erase_aligned(addr, len))?;
        let mut guard = self.buffer.lock();
        let heap = guard.as_mut().ok_or(Error::NoDevice)?;
        let addr = addr as usize;
        heap[addr..addr + len as usize].fill(HEAP_ERASE_VALUE);
        Ok(())
    }

    fn trim(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size as u64
    }
}

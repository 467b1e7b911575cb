//! Byte-stream view of a block device for the FAT engine
//!
//! The engine reads and writes at arbitrary stream offsets; the device
//! only accepts block-quantized I/O. Reads align the window to the
//! device's read unit, writes read-modify-write whole erase blocks so the
//! erase-then-program contract of flash media holds.

use std::sync::Arc;

use mcufs_core::blockdevice::BlockDevice;
use mcufs_core::error::Error;

/// Error carried through the engine's I/O traits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Underlying block device failure
    Device(Error),
    /// The engine hit end-of-stream mid-structure
    UnexpectedEof,
    /// A write made no progress
    WriteZero,
}

impl fatfs::IoError for DiskError {
    fn is_interrupted(&self) -> bool {
        false
    }

    fn new_unexpected_eof_error() -> Self {
        DiskError::UnexpectedEof
    }

    fn new_write_zero_error() -> Self {
        DiskError::WriteZero
    }
}

impl From<DiskError> for Error {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::Device(inner) => inner,
            DiskError::UnexpectedEof | DiskError::WriteZero => Error::Io,
        }
    }
}

/// Seekable stream over a block device
pub struct DiskStream {
    device: Arc<dyn BlockDevice>,
    position: u64,
    size: u64,
}

impl DiskStream {
    /// Wrap `device`; its size is sampled once and defines end-of-stream
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let size = device.size();
        Self {
            device,
            position: 0,
            size,
        }
    }
}

impl fatfs::IoBase for DiskStream {
    type Error = DiskError;
}

impl fatfs::Read for DiskStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.position >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - self.position) as usize);
        if len == 0 {
            return Ok(0);
        }

        let unit = self.device.geometry().read_size as u64;
        let start = self.position / unit * unit;
        let end = (self.position + len as u64).div_ceil(unit) * unit;

        let mut window = vec![0u8; (end - start) as usize];
        self.device
            .read(&mut window, start)
            .map_err(DiskError::Device)?;

        let offset = (self.position - start) as usize;
        buf[..len].copy_from_slice(&window[offset..offset + len]);
        self.position += len as u64;
        Ok(len)
    }
}

impl fatfs::Write for DiskStream {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.position >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - self.position) as usize);
        if len == 0 {
            return Ok(0);
        }

        // Whole erase blocks: read back, patch, erase, program
        let unit = self.device.geometry().erase_size as u64;
        let start = self.position / unit * unit;
        let end = (self.position + len as u64).div_ceil(unit) * unit;

        let mut window = vec![0u8; (end - start) as usize];
        self.device
            .read(&mut window, start)
            .map_err(DiskError::Device)?;

        let offset = (self.position - start) as usize;
        window[offset..offset + len].copy_from_slice(&buf[..len]);

        self.device
            .erase(start, end - start)
            .map_err(DiskError::Device)?;
        self.device
            .program(&window, start)
            .map_err(DiskError::Device)?;

        self.position += len as u64;
        Ok(len)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.device.sync().map_err(DiskError::Device)
    }
}

impl fatfs::Seek for DiskStream {
    fn seek(&mut self, pos: fatfs::SeekFrom) -> Result<u64, Self::Error> {
        let new_pos = match pos {
            fatfs::SeekFrom::Start(offset) => Some(offset),
            fatfs::SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            fatfs::SeekFrom::End(offset) => self.size.checked_add_signed(offset),
        }
        .ok_or(DiskError::Device(Error::InvalidInput))?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

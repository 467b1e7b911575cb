//! Loopback block device implementation

use log::trace;
use parking_lot::Mutex;

use mcufs_core::blockdevice::{BlockDevice, Geometry};
use mcufs_core::error::{Error, Result};
use mcufs_core::filesystem::{OpenFlags, Whence};
use mcufs_core::vfs::Vfs;

const DEVICE_NAME: &str = "loopback";

/// Block device whose storage is a regular file inside an already mounted
/// filesystem.
///
/// Every read and program turns into a seek plus read/write on the backing
/// descriptor, re-entering the VFS while an outer VFS operation is still
/// in flight; the VFS's recursive lock absorbs that. Reads past the
/// backing file's end pad with zeros, erase and trim are no-ops, so the
/// image file only grows as high addresses are actually programmed.
pub struct LoopbackDevice {
    vfs: &'static Vfs,
    path: String,
    capacity: usize,
    block_size: usize,
    fd: Mutex<Option<i32>>,
}

impl LoopbackDevice {
    /// Create a loopback device storing `capacity` bytes in the file at
    /// `path`, quantized into `block_size` blocks. The file is opened (or
    /// created) on `init`.
    pub fn new(vfs: &'static Vfs, path: &str, capacity: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 || capacity % block_size != 0 {
            return Err(Error::InvalidInput);
        }
        Ok(Self {
            vfs,
            path: path.to_string(),
            capacity,
            block_size,
            fd: Mutex::new(None),
        })
    }

    fn check(&self, addr: u64, len: usize, aligned: bool) -> Result<()> {
        if !aligned || addr as usize + len > self.capacity {
            return Err(Error::InvalidInput);
        }
        Ok(())
    }
}

impl BlockDevice for LoopbackDevice {
    fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    fn geometry(&self) -> Geometry {
        Geometry::uniform(self.block_size)
    }

    fn init(&self) -> Result<()> {
        let mut fd = self.fd.lock();
        if fd.is_some() {
            return Ok(());
        }
        trace!("loopback: opening backing file {}", self.path);
        *fd = Some(
            self.vfs
                .open(&self.path, OpenFlags::RDWR | OpenFlags::CREAT)?,
        );
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        let mut fd = self.fd.lock();
        if let Some(fd) = fd.take() {
            self.vfs.close(fd)?;
        }
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.fd.lock().is_some()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, buf.len(), geometry.is_read_aligned(addr, buf.len()))?;
        let guard = self.fd.lock();
        let fd = guard.ok_or(Error::NoDevice)?;

        self.vfs.lseek(fd, addr as i64, Whence::Set)?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.vfs.read(fd, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        // Blocks past the backing file's end read as zeros
        buf[filled..].fill(0);
        Ok(())
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<()> {
        let geometry = self.geometry();
        self.check(addr, buf.len(), geometry.is_program_aligned(addr, buf.len()))?;
        let guard = self.fd.lock();
        let fd = guard.ok_or(Error::NoDevice)?;

        self.vfs.lseek(fd, addr as i64, Whence::Set)?;
        let mut written = 0;
        while written < buf.len() {
            let n = self.vfs.write(fd, &buf[written..])?;
            if n == 0 {
                return Err(Error::Io);
            }
            written += n;
        }
        Ok(())
    }

    fn erase(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn trim(&self, _addr: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        let guard = self.fd.lock();
        match *guard {
            Some(fd) => self.vfs.fsync(fd),
            None => Ok(()),
        }
    }

    fn size(&self) -> u64 {
        self.capacity as u64
    }
}

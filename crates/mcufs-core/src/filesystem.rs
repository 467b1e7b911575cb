//! Filesystem abstraction
//!
//! A [`Filesystem`] adapter binds one third-party filesystem engine to the
//! [`BlockDevice`] interface and exposes a uniform set of path, file and
//! directory operations. Open files and directories are integer handles
//! whose engine-side state lives inside the adapter; the VFS stores the
//! handle together with the owning filesystem in its descriptor tables.

use std::sync::Arc;

use bitflags::bitflags;

use crate::blockdevice::BlockDevice;
use crate::error::Result;

bitflags! {
    /// POSIX-style open flags.
    ///
    /// The access mode occupies the two low bits; `RDONLY` is the absence
    /// of both write bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading only
        const RDONLY = 0;
        /// Open for writing only
        const WRONLY = 0x0001;
        /// Open for reading and writing
        const RDWR   = 0x0002;
        /// Create the file if it does not exist
        const CREAT  = 0x0040;
        /// Fail if `CREAT` and the file already exists
        const EXCL   = 0x0080;
        /// Truncate to zero length on open
        const TRUNC  = 0x0200;
        /// Position writes at end of file
        const APPEND = 0x0400;
    }
}

impl OpenFlags {
    const ACCMODE: u32 = 0x0003;

    /// Whether the descriptor may be read
    pub fn readable(&self) -> bool {
        self.bits() & Self::ACCMODE != Self::WRONLY.bits()
    }

    /// Whether the descriptor may be written
    pub fn writable(&self) -> bool {
        self.bits() & Self::ACCMODE != 0
    }
}

bitflags! {
    /// Options for [`Vfs::mount`](crate::vfs::Vfs::mount)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Format the device and retry when the initial mount fails
        const AUTO_FORMAT = 1 << 0;
    }
}

/// Seek origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the beginning of the file
    Set,
    /// From the current position
    Cur,
    /// From the end of the file
    End,
}

/// Kind of a directory entry or stat target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Dir,
}

/// Result of a `stat`/`fstat` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Size in bytes (0 for directories on most engines)
    pub size: u64,
    /// File or directory
    pub kind: EntryKind,
    /// Write permission withheld by the filesystem
    pub readonly: bool,
}

impl Metadata {
    /// Synthesized `st_mode`-style bits: file-type bits plus full
    /// permissions, with write bits dropped for read-only entries.
    pub fn mode(&self) -> u32 {
        let kind = match self.kind {
            EntryKind::Dir => 0o040000,
            EntryKind::File => 0o100000,
        };
        let perm = if self.readonly { 0o555 } else { 0o777 };
        kind | perm
    }
}

/// One directory entry yielded by [`Filesystem::dir_read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    /// Entry name without any path components
    pub name: String,
    /// File or directory
    pub kind: EntryKind,
}

/// Opaque handle to an open file inside an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(usize);

impl FileHandle {
    /// Wrap a raw adapter-assigned slot number
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw slot number
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Opaque handle to an open directory stream inside an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(usize);

impl DirHandle {
    /// Wrap a raw adapter-assigned slot number
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw slot number
    pub fn raw(&self) -> usize {
        self.0
    }
}

/// Filesystem adapter interface.
///
/// An adapter retains a single mounted device between `mount` and
/// `unmount` and serializes every engine call behind its own mutex; the
/// engines themselves are not assumed thread-safe. Paths are absolute
/// within the filesystem (the VFS strips the mountpoint prefix before
/// forwarding).
pub trait Filesystem: Send + Sync {
    /// Engine name ("FAT", "littlefs")
    fn name(&self) -> &'static str;

    /// Attach a device. `pending_format` signals that the caller is about
    /// to format the volume, so integrity checks that would fail on blank
    /// media must be skipped; engines that need no pre-format mount simply
    /// ignore the flag.
    fn mount(&self, device: Arc<dyn BlockDevice>, pending_format: bool) -> Result<()>;

    /// Flush and detach the mounted device
    fn unmount(&self) -> Result<()>;

    /// Create a fresh filesystem on the device.
    ///
    /// Initializes the device if needed, erases the first two erase
    /// blocks, programs 0xFF across that range so stale superblocks
    /// cannot survive, trims the whole device, then runs the engine's own
    /// format.
    fn format(&self, device: Arc<dyn BlockDevice>) -> Result<()>;

    /// Remove a file (or an empty directory on engines without a distinct
    /// rmdir primitive)
    fn remove(&self, path: &str) -> Result<()>;

    /// Rename a file or directory within this filesystem
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Create a directory. `mode` is accepted and discarded.
    fn mkdir(&self, path: &str, mode: u32) -> Result<()>;

    /// Remove an empty directory
    fn rmdir(&self, path: &str) -> Result<()>;

    /// Look up metadata by path
    fn stat(&self, path: &str) -> Result<Metadata>;

    /// Open a file, translating the POSIX flags to the engine's
    fn file_open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle>;

    /// Close an open file, releasing the engine state
    fn file_close(&self, file: FileHandle) -> Result<()>;

    /// Read at the current position; returns the number of bytes read
    fn file_read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize>;

    /// Write at the current position; returns the number of bytes written
    fn file_write(&self, file: FileHandle, buf: &[u8]) -> Result<usize>;

    /// Flush file data to the device
    fn file_sync(&self, file: FileHandle) -> Result<()>;

    /// Reposition the file cursor; returns the new absolute position
    fn file_seek(&self, file: FileHandle, offset: i64, whence: Whence) -> Result<u64>;

    /// Current cursor position
    fn file_tell(&self, file: FileHandle) -> Result<u64>;

    /// Current file size
    fn file_size(&self, file: FileHandle) -> Result<u64>;

    /// Cut the file to `length` bytes, leaving the cursor unchanged
    fn file_truncate(&self, file: FileHandle, length: u64) -> Result<()>;

    /// Open a directory stream
    fn dir_open(&self, path: &str) -> Result<DirHandle>;

    /// Close a directory stream
    fn dir_close(&self, dir: DirHandle) -> Result<()>;

    /// Next entry, or `None` once the stream is exhausted
    fn dir_read(&self, dir: DirHandle) -> Result<Option<Dirent>>;

    /// Whether sizes reported through an open file become unreliable after
    /// seeking, so `fstat` must re-derive them via `stat` on the path.
    /// FAT behaves this way; the default is `false`.
    fn size_reporting_needs_stat(&self) -> bool {
        false
    }
}

/// Shared pre-format pipeline used by the adapters.
///
/// Initializes the device if needed, erases the first two erase blocks,
/// programs 0xFF across that range so even a robust engine treats the
/// medium as blank, then trims the whole device.
pub fn scrub_for_format(device: &dyn BlockDevice) -> Result<()> {
    if !device.is_initialized() {
        device.init()?;
    }
    let geometry = device.geometry();
    let header = 2 * geometry.erase_size as u64;
    device.erase(0, header)?;

    let blank = vec![0xFF; geometry.program_size];
    let mut offset = 0;
    while offset < header {
        device.program(&blank, offset)?;
        offset += geometry.program_size as u64;
    }

    device.trim(0, device.size())
}

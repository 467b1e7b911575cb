//! VFS multiplexer
//!
//! Grafts mounted filesystems into one namespace rooted at `/` and exposes
//! a POSIX-style descriptor surface over them. Path resolution picks the
//! mountpoint with the longest prefix match and forwards the remainder of
//! the path to that filesystem's adapter.
//!
//! All tables sit behind one process-wide *reentrant* lock: a loopback
//! block device services its reads and programs by calling back into the
//! VFS while an outer VFS operation is still in flight, and the recursive
//! acquisition absorbs that re-entry. The inner `RefCell` is only ever
//! borrowed for short table lookups, never across an adapter call.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::ReentrantMutex;

use crate::blockdevice::BlockDevice;
use crate::error::{Error, Result};
use crate::filesystem::{
    DirHandle, Dirent, EntryKind, FileHandle, Filesystem, Metadata, MountFlags, OpenFlags, Whence,
};

pub use crate::error::strerror;

/// Capacity of the mount table
pub const MOUNTPOINT_MAX: usize = 10;

/// Descriptors below this value fall through to the host's terminal I/O
const RESERVED_FDS: i32 = 3;

/// Initial size of each descriptor table; grows by doubling on demand
const DESCRIPTOR_TABLE_INITIAL: usize = 10;

struct Mountpoint {
    dir: String,
    filesystem: Arc<dyn Filesystem>,
    device: Arc<dyn BlockDevice>,
}

struct FileSlot {
    filesystem: Arc<dyn Filesystem>,
    handle: FileHandle,
    // Kept so fstat can re-derive FAT sizes through stat
    path: String,
}

struct DirSlot {
    filesystem: Arc<dyn Filesystem>,
    handle: DirHandle,
}

struct Tables {
    mountpoints: [Option<Mountpoint>; MOUNTPOINT_MAX],
    files: Vec<Option<FileSlot>>,
    dirs: Vec<Option<DirSlot>>,
}

impl Tables {
    fn new() -> Self {
        Self {
            mountpoints: std::array::from_fn(|_| None),
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// Longest-prefix mountpoint for `path`, if any
    fn find_mountpoint(&self, path: &str) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_len = 0;
        for (i, slot) in self.mountpoints.iter().enumerate() {
            if let Some(mp) = slot {
                if mp.dir.len() > best_len && path.starts_with(&mp.dir) {
                    best = Some(i);
                    best_len = mp.dir.len();
                }
            }
        }
        best
    }
}

/// Strip the mountpoint prefix; the root mountpoint passes paths through
fn entity_path(path: &str, dir: &str) -> String {
    let stripped = if dir == "/" {
        path
    } else {
        &path[dir.len()..]
    };
    if stripped.is_empty() {
        "/".to_string()
    } else {
        stripped.to_string()
    }
}

/// The virtual filesystem: mount table plus file and directory descriptor
/// tables.
///
/// Applications construct one `Vfs`, mount their filesystems into it and
/// route every file operation through it. A process-wide instance is
/// available through [`global`] for environments that want the classic
/// "well-known singleton" wiring.
pub struct Vfs {
    tables: ReentrantMutex<RefCell<Tables>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Create an empty VFS with no mountpoints
    pub fn new() -> Self {
        Self {
            tables: ReentrantMutex::new(RefCell::new(Tables::new())),
        }
    }

    /// Create a filesystem on `device` without touching the mount table
    pub fn format(&self, fs: &Arc<dyn Filesystem>, device: &Arc<dyn BlockDevice>) -> Result<()> {
        let _guard = self.tables.lock();
        fs.format(device.clone())
    }

    /// Mount `fs` (backed by `device`) at the absolute directory `dir`.
    ///
    /// With [`MountFlags::AUTO_FORMAT`], a failed mount is retried once
    /// through format-then-mount, so blank media comes up usable.
    pub fn mount(
        &self,
        dir: &str,
        fs: Arc<dyn Filesystem>,
        device: Arc<dyn BlockDevice>,
        flags: MountFlags,
    ) -> Result<()> {
        if !dir.starts_with('/') {
            return Err(Error::InvalidInput);
        }
        let guard = self.tables.lock();
        {
            let tables = guard.borrow();
            if tables
                .mountpoints
                .iter()
                .flatten()
                .any(|mp| mp.dir == dir)
            {
                return Err(Error::AlreadyExists);
            }
        }

        match fs.mount(device.clone(), false) {
            Ok(()) => {}
            Err(err) if flags.contains(MountFlags::AUTO_FORMAT) => {
                log::info!(
                    "mount of {} at {} failed ({}), auto-formatting",
                    fs.name(),
                    dir,
                    err
                );
                fs.format(device.clone())?;
                fs.mount(device.clone(), false)?;
            }
            Err(err) => return Err(err),
        }

        let mut tables = guard.borrow_mut();
        match tables.mountpoints.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(Mountpoint {
                    dir: dir.to_string(),
                    filesystem: fs,
                    device,
                });
                Ok(())
            }
            None => {
                drop(tables);
                let _ = fs.unmount();
                Err(Error::OutOfMemory)
            }
        }
    }

    /// Unmount the filesystem resolved by `path`
    pub fn unmount(&self, path: &str) -> Result<()> {
        let guard = self.tables.lock();
        let (index, fs) = {
            let tables = guard.borrow();
            let index = tables.find_mountpoint(path).ok_or(Error::NotFound)?;
            let mp = tables.mountpoints[index].as_ref().unwrap();
            (index, mp.filesystem.clone())
        };
        fs.unmount()?;
        guard.borrow_mut().mountpoints[index] = None;
        Ok(())
    }

    /// Reformat the mountpoint resolved by `path` in place:
    /// unmount, format, mount again with identical filesystem and device
    /// bindings. The mount-table entry survives untouched.
    pub fn reformat(&self, path: &str) -> Result<()> {
        let guard = self.tables.lock();
        let (fs, device) = {
            let tables = guard.borrow();
            let index = tables.find_mountpoint(path).ok_or(Error::NotFound)?;
            let mp = tables.mountpoints[index].as_ref().unwrap();
            (mp.filesystem.clone(), mp.device.clone())
        };
        fs.unmount()?;
        fs.format(device.clone())?;
        fs.mount(device, false)
    }

    /// The filesystem and device bound at the mountpoint resolving `path`
    pub fn info(&self, path: &str) -> Result<(Arc<dyn Filesystem>, Arc<dyn BlockDevice>)> {
        let guard = self.tables.lock();
        let tables = guard.borrow();
        let index = tables.find_mountpoint(path).ok_or(Error::NotFound)?;
        let mp = tables.mountpoints[index].as_ref().unwrap();
        Ok((mp.filesystem.clone(), mp.device.clone()))
    }

    fn resolve(&self, path: &str) -> Result<(Arc<dyn Filesystem>, String, String)> {
        let guard = self.tables.lock();
        let tables = guard.borrow();
        let index = tables.find_mountpoint(path).ok_or(Error::NotFound)?;
        let mp = tables.mountpoints[index].as_ref().unwrap();
        Ok((
            mp.filesystem.clone(),
            entity_path(path, &mp.dir),
            mp.dir.clone(),
        ))
    }

    /// Open `path` and return a descriptor (always ≥ 3)
    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<i32> {
        let guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        let handle = fs.file_open(&entity, flags)?;

        let mut tables = guard.borrow_mut();
        let index = match allocate_slot(&mut tables.files) {
            Ok(index) => index,
            Err(err) => {
                drop(tables);
                let _ = fs.file_close(handle);
                return Err(err);
            }
        };
        tables.files[index] = Some(FileSlot {
            filesystem: fs,
            handle,
            path: entity,
        });
        Ok(index as i32 + RESERVED_FDS)
    }

    /// Close a descriptor; the slot becomes reusable even if the engine
    /// reports an error on close
    pub fn close(&self, fd: i32) -> Result<()> {
        if fd < RESERVED_FDS {
            return Ok(());
        }
        let guard = self.tables.lock();
        let slot = guard
            .borrow_mut()
            .files
            .get_mut((fd - RESERVED_FDS) as usize)
            .ok_or(Error::BadDescriptor)?
            .take()
            .ok_or(Error::BadDescriptor)?;
        slot.filesystem.file_close(slot.handle)
    }

    fn file_slot(&self, fd: i32) -> Result<(Arc<dyn Filesystem>, FileHandle, String)> {
        let guard = self.tables.lock();
        let tables = guard.borrow();
        let slot = tables
            .files
            .get((fd - RESERVED_FDS) as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::BadDescriptor)?;
        Ok((slot.filesystem.clone(), slot.handle, slot.path.clone()))
    }

    /// Read from a descriptor. Descriptor 0 reads the host's stdin.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        if fd < RESERVED_FDS {
            if fd == 0 {
                return std::io::stdin().read(buf).map_err(|_| Error::Io);
            }
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_read(handle, buf)
    }

    /// Write to a descriptor. Descriptors 1 and 2 write the host's
    /// stdout/stderr.
    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize> {
        if fd < RESERVED_FDS {
            return match fd {
                1 => std::io::stdout()
                    .write_all(buf)
                    .map(|_| buf.len())
                    .map_err(|_| Error::Io),
                2 => std::io::stderr()
                    .write_all(buf)
                    .map(|_| buf.len())
                    .map_err(|_| Error::Io),
                _ => Err(Error::BadDescriptor),
            };
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_write(handle, buf)
    }

    /// Reposition a descriptor; returns the new absolute offset
    pub fn lseek(&self, fd: i32, offset: i64, whence: Whence) -> Result<u64> {
        if fd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_seek(handle, offset, whence)
    }

    /// Current offset of a descriptor
    pub fn tell(&self, fd: i32) -> Result<u64> {
        if fd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_tell(handle)
    }

    /// Truncate the file behind a descriptor to `length` bytes
    pub fn ftruncate(&self, fd: i32, length: u64) -> Result<()> {
        if fd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_truncate(handle, length)
    }

    /// Flush buffered data of a descriptor to its device
    pub fn fsync(&self, fd: i32) -> Result<()> {
        if fd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, _) = self.file_slot(fd)?;
        fs.file_sync(handle)
    }

    /// Metadata of an open descriptor.
    ///
    /// The size is taken by seeking to the end and restoring the position,
    /// except on filesystems whose reported size is unreliable after
    /// seeking (FAT); there the stored path is re-resolved through `stat`.
    pub fn fstat(&self, fd: i32) -> Result<Metadata> {
        if fd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let _guard = self.tables.lock();
        let (fs, handle, path) = self.file_slot(fd)?;
        if fs.size_reporting_needs_stat() {
            return fs.stat(&path);
        }
        let current = fs.file_tell(handle)?;
        let size = fs.file_seek(handle, 0, Whence::End)?;
        let restored = fs.file_seek(handle, current as i64, Whence::Set)?;
        if restored != current {
            return Err(Error::Io);
        }
        Ok(Metadata {
            size,
            kind: EntryKind::File,
            readonly: false,
        })
    }

    /// Metadata by path
    pub fn stat(&self, path: &str) -> Result<Metadata> {
        let _guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        fs.stat(&entity)
    }

    /// Remove a file
    pub fn unlink(&self, path: &str) -> Result<()> {
        let _guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        fs.remove(&entity)
    }

    /// Rename within one mountpoint; crossing mountpoints is rejected
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self.tables.lock();
        let (fs, from_entity, from_dir) = self.resolve(from)?;
        let (_, to_entity, to_dir) = self.resolve(to)?;
        if from_dir != to_dir {
            return Err(Error::CrossDevice);
        }
        fs.rename(&from_entity, &to_entity)
    }

    /// Create a directory; `mode` is accepted and discarded
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let _guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        fs.mkdir(&entity, mode)
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let _guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        fs.rmdir(&entity)
    }

    /// Open a directory stream and return its descriptor
    pub fn opendir(&self, path: &str) -> Result<i32> {
        let guard = self.tables.lock();
        let (fs, entity, _) = self.resolve(path)?;
        let handle = fs.dir_open(&entity)?;

        let mut tables = guard.borrow_mut();
        let index = match allocate_slot(&mut tables.dirs) {
            Ok(index) => index,
            Err(err) => {
                drop(tables);
                let _ = fs.dir_close(handle);
                return Err(err);
            }
        };
        tables.dirs[index] = Some(DirSlot {
            filesystem: fs,
            handle,
        });
        Ok(index as i32 + RESERVED_FDS)
    }

    /// Next entry of a directory stream, `None` when exhausted
    pub fn readdir(&self, dirfd: i32) -> Result<Option<Dirent>> {
        if dirfd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let guard = self.tables.lock();
        let (fs, handle) = {
            let tables = guard.borrow();
            let slot = tables
                .dirs
                .get((dirfd - RESERVED_FDS) as usize)
                .and_then(|s| s.as_ref())
                .ok_or(Error::BadDescriptor)?;
            (slot.filesystem.clone(), slot.handle)
        };
        fs.dir_read(handle)
    }

    /// Close a directory stream
    pub fn closedir(&self, dirfd: i32) -> Result<()> {
        if dirfd < RESERVED_FDS {
            return Err(Error::BadDescriptor);
        }
        let guard = self.tables.lock();
        let slot = guard
            .borrow_mut()
            .dirs
            .get_mut((dirfd - RESERVED_FDS) as usize)
            .ok_or(Error::BadDescriptor)?
            .take()
            .ok_or(Error::BadDescriptor)?;
        slot.filesystem.dir_close(slot.handle)
    }
}

/// First free slot in a descriptor table, growing it by doubling when
/// every slot is taken
fn allocate_slot<T>(table: &mut Vec<Option<T>>) -> Result<usize> {
    if let Some(index) = table.iter().position(|slot| slot.is_none()) {
        return Ok(index);
    }
    let grown = if table.is_empty() {
        DESCRIPTOR_TABLE_INITIAL
    } else {
        table.len() * 2
    };
    table
        .try_reserve(grown - table.len())
        .map_err(|_| Error::TooManyOpenFiles)?;
    let index = table.len();
    table.resize_with(grown, || None);
    Ok(index)
}

static GLOBAL: Lazy<Vfs> = Lazy::new(Vfs::new);

/// The process-wide VFS instance
pub fn global() -> &'static Vfs {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdevice::Geometry;
    use parking_lot::Mutex;

    struct NullDevice;

    impl BlockDevice for NullDevice {
        fn name(&self) -> &'static str {
            "heap"
        }
        fn geometry(&self) -> Geometry {
            Geometry::uniform(512)
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
        fn read(&self, _buf: &mut [u8], _addr: u64) -> Result<()> {
            Ok(())
        }
        fn program(&self, _buf: &[u8], _addr: u64) -> Result<()> {
            Ok(())
        }
        fn erase(&self, _addr: u64, _len: u64) -> Result<()> {
            Ok(())
        }
        fn trim(&self, _addr: u64, _len: u64) -> Result<()> {
            Ok(())
        }
        fn sync(&self) -> Result<()> {
            Ok(())
        }
        fn size(&self) -> u64 {
            0
        }
    }

    /// Records the entity paths it is handed, so resolution is observable
    struct RecordingFs {
        opened: Mutex<Vec<String>>,
        next: Mutex<usize>,
    }

    impl RecordingFs {
        fn new() -> Self {
            Self {
                opened: Mutex::new(Vec::new()),
                next: Mutex::new(0),
            }
        }
    }

    impl Filesystem for RecordingFs {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn mount(&self, _device: Arc<dyn BlockDevice>, _pending: bool) -> Result<()> {
            Ok(())
        }
        fn unmount(&self) -> Result<()> {
            Ok(())
        }
        fn format(&self, _device: Arc<dyn BlockDevice>) -> Result<()> {
            Ok(())
        }
        fn remove(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn rename(&self, _from: &str, _to: &str) -> Result<()> {
            Ok(())
        }
        fn mkdir(&self, _path: &str, _mode: u32) -> Result<()> {
            Ok(())
        }
        fn rmdir(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn stat(&self, _path: &str) -> Result<Metadata> {
            Err(Error::NotFound)
        }
        fn file_open(&self, path: &str, _flags: OpenFlags) -> Result<FileHandle> {
            self.opened.lock().push(path.to_string());
            let mut next = self.next.lock();
            *next += 1;
            Ok(FileHandle::from_raw(*next))
        }
        fn file_close(&self, _file: FileHandle) -> Result<()> {
            Ok(())
        }
        fn file_read(&self, _file: FileHandle, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }
        fn file_write(&self, _file: FileHandle, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
        fn file_sync(&self, _file: FileHandle) -> Result<()> {
            Ok(())
        }
        fn file_seek(&self, _file: FileHandle, _offset: i64, _whence: Whence) -> Result<u64> {
            Ok(0)
        }
        fn file_tell(&self, _file: FileHandle) -> Result<u64> {
            Ok(0)
        }
        fn file_size(&self, _file: FileHandle) -> Result<u64> {
            Ok(0)
        }
        fn file_truncate(&self, _file: FileHandle, _length: u64) -> Result<()> {
            Ok(())
        }
        fn dir_open(&self, _path: &str) -> Result<DirHandle> {
            Ok(DirHandle::from_raw(0))
        }
        fn dir_close(&self, _dir: DirHandle) -> Result<()> {
            Ok(())
        }
        fn dir_read(&self, _dir: DirHandle) -> Result<Option<Dirent>> {
            Ok(None)
        }
    }

    fn mounted_vfs() -> (Vfs, Arc<RecordingFs>, Arc<RecordingFs>) {
        let vfs = Vfs::new();
        let root = Arc::new(RecordingFs::new());
        let sd = Arc::new(RecordingFs::new());
        let device: Arc<dyn BlockDevice> = Arc::new(NullDevice);
        vfs.mount("/", root.clone(), device.clone(), MountFlags::empty())
            .unwrap();
        vfs.mount("/sd", sd.clone(), device, MountFlags::empty())
            .unwrap();
        (vfs, root, sd)
    }

    #[test]
    fn test_longest_prefix_resolution() {
        let (vfs, root, sd) = mounted_vfs();

        vfs.open("/sd/data.txt", OpenFlags::RDONLY).unwrap();
        assert_eq!(sd.opened.lock().as_slice(), ["/data.txt"]);

        vfs.open("/top.txt", OpenFlags::RDONLY).unwrap();
        assert_eq!(root.opened.lock().as_slice(), ["/top.txt"]);
    }

    #[test]
    fn test_descriptors_start_at_three_and_recycle() {
        let (vfs, _, _) = mounted_vfs();

        let fds: Vec<i32> = (0..5)
            .map(|i| {
                vfs.open(&format!("/f{}", i), OpenFlags::RDONLY).unwrap()
            })
            .collect();
        assert_eq!(fds, [3, 4, 5, 6, 7]);

        for fd in &fds {
            vfs.close(*fd).unwrap();
        }
        assert_eq!(vfs.open("/f6", OpenFlags::RDONLY).unwrap(), 3);
    }

    #[test]
    fn test_descriptor_table_growth() {
        let (vfs, _, _) = mounted_vfs();
        let fds: Vec<i32> = (0..25)
            .map(|i| {
                vfs.open(&format!("/f{}", i), OpenFlags::RDONLY).unwrap()
            })
            .collect();
        // No duplicates and no gaps
        for (i, fd) in fds.iter().enumerate() {
            assert_eq!(*fd, i as i32 + 3);
        }
    }

    #[test]
    fn test_unmounted_path_is_not_found() {
        let vfs = Vfs::new();
        assert_eq!(
            vfs.open("/nope", OpenFlags::RDONLY).unwrap_err(),
            Error::NotFound
        );
        assert_eq!(vfs.unmount("/nope").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_duplicate_mountpoint_rejected() {
        let (vfs, root, _) = mounted_vfs();
        let device: Arc<dyn BlockDevice> = Arc::new(NullDevice);
        assert_eq!(
            vfs.mount("/", root, device, MountFlags::empty())
                .unwrap_err(),
            Error::AlreadyExists
        );
    }

    #[test]
    fn test_cross_mountpoint_rename_rejected() {
        let (vfs, _, _) = mounted_vfs();
        assert_eq!(
            vfs.rename("/a", "/sd/b").unwrap_err(),
            Error::CrossDevice
        );
    }

    #[test]
    fn test_bad_descriptor() {
        let (vfs, _, _) = mounted_vfs();
        assert_eq!(vfs.close(42).unwrap_err(), Error::BadDescriptor);
        assert_eq!(vfs.tell(1).unwrap_err(), Error::BadDescriptor);
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(99, &mut buf).unwrap_err(), Error::BadDescriptor);
    }

    #[test]
    fn test_info_returns_bindings() {
        let (vfs, _, _) = mounted_vfs();
        let (fs, device) = vfs.info("/sd/whatever").unwrap();
        assert_eq!(fs.name(), "recording");
        assert_eq!(device.name(), "heap");
    }
}

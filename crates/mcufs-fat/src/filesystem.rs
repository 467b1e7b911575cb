//! FAT adapter implementation

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use mcufs_core::blockdevice::BlockDevice;
use mcufs_core::clock::{Clock, SystemClock};
use mcufs_core::error::{Error, Result};
use mcufs_core::filesystem::{
    scrub_for_format, DirHandle, Dirent, EntryKind, FileHandle, Filesystem, Metadata, OpenFlags,
    Whence,
};

use crate::disk::{DiskError, DiskStream};
use crate::time::ClockProvider;

const FILESYSTEM_NAME: &str = "FAT";

/// FAT sectors stay within this range regardless of device geometry
const SECTOR_SIZE_MIN: usize = 512;
const SECTOR_SIZE_MAX: usize = 4096;

type FatFs = fatfs::FileSystem<DiskStream, ClockProvider, fatfs::LossyOemCpConverter>;
type FatFile = fatfs::File<'static, DiskStream, ClockProvider, fatfs::LossyOemCpConverter>;
type FatDirIter = fatfs::DirIter<'static, DiskStream, ClockProvider, fatfs::LossyOemCpConverter>;
type FatDirEntry = fatfs::DirEntry<'static, DiskStream, ClockProvider, fatfs::LossyOemCpConverter>;

fn error_remap(err: fatfs::Error<DiskError>) -> Error {
    match err {
        fatfs::Error::Io(inner) => inner.into(),
        fatfs::Error::NotFound => Error::NotFound,
        fatfs::Error::AlreadyExists => Error::AlreadyExists,
        fatfs::Error::InvalidInput => Error::InvalidInput,
        fatfs::Error::DirectoryIsNotEmpty => Error::NotEmpty,
        fatfs::Error::NotEnoughSpace => Error::NoSpace,
        // No recognizable FAT volume
        fatfs::Error::CorruptedFileSystem => Error::InvalidInput,
        fatfs::Error::InvalidFileNameLength => Error::InvalidInput,
        fatfs::Error::UnsupportedFileNameCharacter => Error::InvalidInput,
        fatfs::Error::UnexpectedEof | fatfs::Error::WriteZero => Error::Io,
        _ => Error::Io,
    }
}

/// FAT paths carry no leading separator; the empty path is the root
fn fat_path(path: &str) -> &str {
    path.trim_start_matches('/')
}

struct OpenFatFile {
    file: FatFile,
    flags: OpenFlags,
}

struct Mounted {
    fs: Box<FatFs>,
    files: HashMap<usize, OpenFatFile>,
    dirs: HashMap<usize, FatDirIter>,
    next_handle: usize,
}

// Engine handles keep raw references into the boxed FileSystem; the box
// never moves while mounted and all access is serialized by the adapter
// mutex.
unsafe impl Send for Mounted {}

impl Mounted {
    /// Locate a directory entry by path, FAT-style case-insensitively
    fn find_entry(&self, path: &str) -> Result<FatDirEntry> {
        let (parent, name) = match path.rfind('/') {
            Some(split) => (&path[..split], &path[split + 1..]),
            None => ("", path),
        };
        let root = self.fs.root_dir();
        let dir = if parent.is_empty() {
            root
        } else {
            root.open_dir(parent).map_err(error_remap)?
        };
        for entry in dir.iter() {
            let entry = entry.map_err(error_remap)?;
            if entry.file_name().eq_ignore_ascii_case(name) {
                return Ok(unsafe { std::mem::transmute::<fatfs::DirEntry<'_, _, _, _>, FatDirEntry>(entry) });
            }
        }
        Err(Error::NotFound)
    }
}

/// FAT bound to the common [`Filesystem`] interface.
///
/// Timestamps come from the [`Clock`] captured at construction. A second
/// mutex is dedicated to the long-running `format` path so it does not
/// serialize against ordinary operations of this adapter.
pub struct FatFilesystem {
    clock: Arc<dyn Clock>,
    state: Mutex<Option<Mounted>>,
    format_lock: Mutex<()>,
}

impl FatFilesystem {
    /// Create an adapter deriving timestamps from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(None),
            format_lock: Mutex::new(()),
        }
    }

    /// Adapter stamping files from the host's system time
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Filesystem for FatFilesystem {
    fn name(&self) -> &'static str {
        FILESYSTEM_NAME
    }

    fn mount(&self, device: Arc<dyn BlockDevice>, _pending_format: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(Error::Busy);
        }
        device.init()?;

        let disk = DiskStream::new(device);
        let options = fatfs::FsOptions::new().time_provider(ClockProvider::new(self.clock.clone()));
        let fs = fatfs::FileSystem::new(disk, options).map_err(error_remap)?;

        *state = Some(Mounted {
            fs: Box::new(fs),
            files: HashMap::new(),
            dirs: HashMap::new(),
            next_handle: 0,
        });
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut mounted = state.take().ok_or(Error::InvalidInput)?;
        if !mounted.files.is_empty() || !mounted.dirs.is_empty() {
            debug!(
                "fat: unmounting with {} open files, {} open dirs",
                mounted.files.len(),
                mounted.dirs.len()
            );
        }
        // Engine handles borrow the filesystem; release them first
        mounted.files.clear();
        mounted.dirs.clear();
        let fs = *mounted.fs;
        fs.unmount().map_err(error_remap)
    }

    fn format(&self, device: Arc<dyn BlockDevice>) -> Result<()> {
        let _format_guard = self.format_lock.lock();
        if self.state.lock().is_some() {
            return Err(Error::Busy);
        }
        scrub_for_format(&*device)?;

        let sector_size = device
            .geometry()
            .erase_size
            .clamp(SECTOR_SIZE_MIN, SECTOR_SIZE_MAX);
        let mut disk = DiskStream::new(device);
        let options = fatfs::FormatVolumeOptions::new().bytes_per_sector(sector_size as u16);
        fatfs::format_volume(&mut disk, options).map_err(error_remap)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let state = self.state.lock();
        let mounted = state.as_ref().ok_or(Error::NoDevice)?;
        mounted
            .fs
            .root_dir()
            .remove(fat_path(path))
            .map_err(error_remap)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let state = self.state.lock();
        let mounted = state.as_ref().ok_or(Error::NoDevice)?;
        let root = mounted.fs.root_dir();
        root.rename(fat_path(from), &root, fat_path(to))
            .map_err(error_remap)
    }

    fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        let state = self.state.lock();
        let mounted = state.as_ref().ok_or(Error::NoDevice)?;
        let path = fat_path(path);
        // The engine's create is open-or-create; POSIX mkdir must fail on
        // an existing entry
        if mounted.find_entry(path).is_ok() {
            return Err(Error::AlreadyExists);
        }
        mounted
            .fs
            .root_dir()
            .create_dir(path)
            .map(|_| ())
            .map_err(error_remap)
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        // FAT removes directories through the same unlink primitive
        self.remove(path)
    }

    fn stat(&self, path: &str) -> Result<Metadata> {
        let state = self.state.lock();
        let mounted = state.as_ref().ok_or(Error::NoDevice)?;
        let path = fat_path(path);
        if path.is_empty() {
            return Ok(Metadata {
                size: 0,
                kind: EntryKind::Dir,
                readonly: false,
            });
        }
        let entry = mounted.find_entry(path)?;
        Ok(Metadata {
            size: entry.len(),
            kind: if entry.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            },
            readonly: entry
                .attributes()
                .contains(fatfs::FileAttributes::READ_ONLY),
        })
    }

    fn file_open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let path = fat_path(path);

        if flags.contains(OpenFlags::EXCL) && mounted.find_entry(path).is_ok() {
            return Err(Error::AlreadyExists);
        }

        let root = mounted.fs.root_dir();
        let mut file = if flags.contains(OpenFlags::CREAT) {
            let mut file = root.create_file(path).map_err(error_remap)?;
            if flags.contains(OpenFlags::TRUNC) {
                file.truncate().map_err(error_remap)?;
            }
            file
        } else {
            root.open_file(path).map_err(error_remap)?
        };

        if flags.contains(OpenFlags::APPEND) {
            fatfs::Seek::seek(&mut file, fatfs::SeekFrom::End(0)).map_err(error_remap)?;
        }

        let file = unsafe { std::mem::transmute::<fatfs::File<'_, _, _, _>, FatFile>(file) };
        mounted.next_handle += 1;
        let handle = mounted.next_handle;
        mounted.files.insert(handle, OpenFatFile { file, flags });
        Ok(FileHandle::from_raw(handle))
    }

    fn file_close(&self, handle: FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let mut open = mounted
            .files
            .remove(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        fatfs::Write::flush(&mut open.file).map_err(error_remap)
    }

    fn file_read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let open = mounted
            .files
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        if !open.flags.readable() {
            return Err(Error::PermissionDenied);
        }

        let mut total = 0;
        while total < buf.len() {
            let n = fatfs::Read::read(&mut open.file, &mut buf[total..]).map_err(error_remap)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn file_write(&self, handle: FileHandle, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let open = mounted
            .files
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        if !open.flags.writable() {
            return Err(Error::PermissionDenied);
        }

        let mut total = 0;
        while total < buf.len() {
            let n = fatfs::Write::write(&mut open.file, &buf[total..]).map_err(error_remap)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        // Directory metadata follows every write
        fatfs::Write::flush(&mut open.file).map_err(error_remap)?;
        Ok(total)
    }

    fn file_sync(&self, handle: FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let open = mounted
            .files
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        fatfs::Write::flush(&mut open.file).map_err(error_remap)
    }

    fn file_seek(&self, handle: FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let open = mounted
            .files
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        let pos = match whence {
            Whence::Set => {
                if offset < 0 {
                    return Err(Error::InvalidInput);
                }
                fatfs::SeekFrom::Start(offset as u64)
            }
            Whence::Cur => fatfs::SeekFrom::Current(offset),
            Whence::End => fatfs::SeekFrom::End(offset),
        };
        fatfs::Seek::seek(&mut open.file, pos).map_err(error_remap)
    }

    fn file_tell(&self, handle: FileHandle) -> Result<u64> {
        self.file_seek(handle, 0, Whence::Cur)
    }

    fn file_size(&self, handle: FileHandle) -> Result<u64> {
        let current = self.file_seek(handle, 0, Whence::Cur)?;
        let size = self.file_seek(handle, 0, Whence::End)?;
        self.file_seek(handle, current as i64, Whence::Set)?;
        Ok(size)
    }

    fn file_truncate(&self, handle: FileHandle, length: u64) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let open = mounted
            .files
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;

        let current = fatfs::Seek::seek(&mut open.file, fatfs::SeekFrom::Current(0))
            .map_err(error_remap)?;
        fatfs::Seek::seek(&mut open.file, fatfs::SeekFrom::Start(length)).map_err(error_remap)?;
        fatfs::File::truncate(&mut open.file).map_err(error_remap)?;
        let restore = current.min(length);
        fatfs::Seek::seek(&mut open.file, fatfs::SeekFrom::Start(restore)).map_err(error_remap)?;
        Ok(())
    }

    fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let path = fat_path(path);

        let root = mounted.fs.root_dir();
        let iter = if path.is_empty() {
            root.iter()
        } else {
            root.open_dir(path).map_err(error_remap)?.iter()
        };
        let iter = unsafe { std::mem::transmute::<fatfs::DirIter<'_, _, _, _>, FatDirIter>(iter) };

        mounted.next_handle += 1;
        let handle = mounted.next_handle;
        mounted.dirs.insert(handle, iter);
        Ok(DirHandle::from_raw(handle))
    }

    fn dir_close(&self, handle: DirHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        mounted
            .dirs
            .remove(&handle.raw())
            .map(|_| ())
            .ok_or(Error::BadDescriptor)
    }

    fn dir_read(&self, handle: DirHandle) -> Result<Option<Dirent>> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let iter = mounted
            .dirs
            .get_mut(&handle.raw())
            .ok_or(Error::BadDescriptor)?;

        for entry in iter.by_ref() {
            let entry = entry.map_err(error_remap)?;
            let name = entry.file_name();
            // FAT's readdir hides the dot entries
            if name == "." || name == ".." {
                continue;
            }
            return Ok(Some(Dirent {
                name,
                kind: if entry.is_dir() {
                    EntryKind::Dir
                } else {
                    EntryKind::File
                },
            }));
        }
        Ok(None)
    }

    fn size_reporting_needs_stat(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcufs_heap::HeapDevice;

    fn fresh_fs() -> (FatFilesystem, Arc<dyn BlockDevice>) {
        let device: Arc<dyn BlockDevice> = Arc::new(HeapDevice::new(1024 * 1024).unwrap());
        let fs = FatFilesystem::with_system_clock();
        fs.format(device.clone()).unwrap();
        fs.mount(device.clone(), false).unwrap();
        (fs, device)
    }

    #[test]
    fn test_mount_blank_media_fails() {
        let device: Arc<dyn BlockDevice> = Arc::new(HeapDevice::new(1024 * 1024).unwrap());
        let fs = FatFilesystem::with_system_clock();
        assert!(fs.mount(device, false).is_err());
    }

    #[test]
    fn test_write_read_round_trip() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/HELLO.TXT", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        assert_eq!(fs.file_write(handle, b"Hello World!\n").unwrap(), 13);
        fs.file_close(handle).unwrap();

        let handle = fs.file_open("/HELLO.TXT", OpenFlags::RDONLY).unwrap();
        let mut buf = [0u8; 512];
        assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"Hello World!\n");
        fs.file_close(handle).unwrap();
        fs.unmount().unwrap();
    }

    #[test]
    fn test_stat_reports_size_and_kind() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/data.bin", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(handle, &[0u8; 777]).unwrap();
        fs.file_close(handle).unwrap();

        let meta = fs.stat("/data.bin").unwrap();
        assert_eq!(meta.size, 777);
        assert_eq!(meta.kind, EntryKind::File);
        assert!(!meta.readonly);
        assert_eq!(meta.mode() & 0o170000, 0o100000);

        fs.mkdir("/sub", 0o777).unwrap();
        assert_eq!(fs.stat("/sub").unwrap().kind, EntryKind::Dir);
        assert_eq!(fs.stat("/").unwrap().kind, EntryKind::Dir);

        assert!(fs.size_reporting_needs_stat());
    }

    #[test]
    fn test_mkdir_rmdir_and_not_empty() {
        let (fs, _device) = fresh_fs();

        fs.mkdir("/dir", 0o777).unwrap();
        assert_eq!(fs.mkdir("/dir", 0o777).unwrap_err(), Error::AlreadyExists);

        let handle = fs
            .file_open("/dir/inner.txt", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(handle).unwrap();

        assert_eq!(fs.rmdir("/dir").unwrap_err(), Error::NotEmpty);
        fs.remove("/dir/inner.txt").unwrap();
        fs.rmdir("/dir").unwrap();
        assert_eq!(fs.stat("/dir").unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_readdir_hides_dot_entries() {
        let (fs, _device) = fresh_fs();

        fs.mkdir("/dir", 0o777).unwrap();
        for name in ["/dir/a.txt", "/dir/b.txt"] {
            let handle = fs
                .file_open(name, OpenFlags::WRONLY | OpenFlags::CREAT)
                .unwrap();
            fs.file_close(handle).unwrap();
        }

        let dir = fs.dir_open("/dir").unwrap();
        let mut names = Vec::new();
        while let Some(entry) = fs.dir_read(dir).unwrap() {
            names.push(entry.name);
        }
        fs.dir_close(dir).unwrap();

        names.sort();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[test]
    fn test_excl_rejects_existing() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/once", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_close(handle).unwrap();
        assert_eq!(
            fs.file_open(
                "/once",
                OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL
            )
            .unwrap_err(),
            Error::AlreadyExists
        );
    }

    #[test]
    fn test_truncate_shortens_file() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/x", OpenFlags::RDWR | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(handle, b"123456789ABCDEF").unwrap();
        fs.file_seek(handle, 0, Whence::Set).unwrap();
        fs.file_truncate(handle, 9).unwrap();

        let mut buf = [0u8; 512];
        assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"123456789");
        fs.file_close(handle).unwrap();

        assert_eq!(fs.stat("/x").unwrap().size, 9);
    }

    #[test]
    fn test_access_mode_enforced() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/ro", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(handle, b"data").unwrap();
        fs.file_close(handle).unwrap();

        let handle = fs.file_open("/ro", OpenFlags::RDONLY).unwrap();
        assert_eq!(
            fs.file_write(handle, b"nope").unwrap_err(),
            Error::PermissionDenied
        );
        let mut buf = [0u8; 4];
        fs.file_read(handle, &mut buf).unwrap();
        fs.file_close(handle).unwrap();
    }

    #[test]
    fn test_rename_replaces_path() {
        let (fs, _device) = fresh_fs();

        let handle = fs
            .file_open("/old", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(handle, b"payload").unwrap();
        fs.file_close(handle).unwrap();

        fs.rename("/old", "/new").unwrap();
        assert_eq!(fs.stat("/old").unwrap_err(), Error::NotFound);
        assert_eq!(fs.stat("/new").unwrap().size, 7);
    }

    #[test]
    fn test_contents_survive_remount() {
        let (fs, device) = fresh_fs();

        let handle = fs
            .file_open("/persist", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(handle, b"still here").unwrap();
        fs.file_close(handle).unwrap();
        fs.unmount().unwrap();

        fs.mount(device, false).unwrap();
        assert_eq!(fs.stat("/persist").unwrap().size, 10);
    }
}

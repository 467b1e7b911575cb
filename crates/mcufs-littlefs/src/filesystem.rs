//! littlefs adapter implementation
//!
//! Binds the littlefs engine (through its C bindings) to the
//! [`BlockDevice`] interface. The engine configuration is rebuilt from
//! the device geometry on every mount and format; all engine buffers are
//! owned here so the bindings never allocate.

use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::sync::Arc;

use littlefs2_sys as ll;
use log::debug;
use parking_lot::Mutex;

use mcufs_core::blockdevice::BlockDevice;
use mcufs_core::error::{Error, Result};
use mcufs_core::filesystem::{
    scrub_for_format, DirHandle, Dirent, EntryKind, FileHandle, Filesystem, Metadata, OpenFlags,
    Whence,
};

/// littlefs ABI constants, declared against the engine's stable C header
/// values rather than generated enum names.
mod abi {
    pub const LFS_ERR_IO: i32 = -5;
    pub const LFS_ERR_CORRUPT: i32 = -84;
    pub const LFS_ERR_NOENT: i32 = -2;
    pub const LFS_ERR_EXIST: i32 = -17;
    pub const LFS_ERR_NOTDIR: i32 = -20;
    pub const LFS_ERR_ISDIR: i32 = -21;
    pub const LFS_ERR_NOTEMPTY: i32 = -39;
    pub const LFS_ERR_BADF: i32 = -9;
    pub const LFS_ERR_FBIG: i32 = -27;
    pub const LFS_ERR_INVAL: i32 = -22;
    pub const LFS_ERR_NOSPC: i32 = -28;
    pub const LFS_ERR_NOMEM: i32 = -12;
    pub const LFS_ERR_NAMETOOLONG: i32 = -36;

    pub const LFS_O_RDONLY: i32 = 1;
    pub const LFS_O_WRONLY: i32 = 2;
    pub const LFS_O_RDWR: i32 = 3;
    pub const LFS_O_CREAT: i32 = 0x0100;
    pub const LFS_O_EXCL: i32 = 0x0200;
    pub const LFS_O_TRUNC: i32 = 0x0400;
    pub const LFS_O_APPEND: i32 = 0x0800;

    pub const LFS_SEEK_SET: i32 = 0;
    pub const LFS_SEEK_CUR: i32 = 1;
    pub const LFS_SEEK_END: i32 = 2;

    pub const LFS_TYPE_REG: u8 = 0x001;
    pub const LFS_TYPE_DIR: u8 = 0x002;
}

const FILESYSTEM_NAME: &str = "littlefs";

/// Tunables that survive across mounts
#[derive(Debug, Clone, Copy)]
pub struct LittleFsConfig {
    /// Erase cycles before littlefs relocates a metadata block
    pub block_cycles: i32,
    /// Lookahead bitmap size in bytes; rounded to a multiple of 8
    pub lookahead_size: u32,
}

impl Default for LittleFsConfig {
    fn default() -> Self {
        Self {
            block_cycles: 500,
            lookahead_size: 16,
        }
    }
}

fn error_remap(code: i32) -> Error {
    match code {
        abi::LFS_ERR_IO => Error::Io,
        abi::LFS_ERR_CORRUPT => Error::CorruptedData,
        abi::LFS_ERR_NOENT => Error::NotFound,
        abi::LFS_ERR_EXIST => Error::AlreadyExists,
        abi::LFS_ERR_NOTDIR => Error::NotADirectory,
        abi::LFS_ERR_ISDIR => Error::IsADirectory,
        abi::LFS_ERR_NOTEMPTY => Error::NotEmpty,
        abi::LFS_ERR_BADF => Error::BadDescriptor,
        abi::LFS_ERR_FBIG => Error::FileTooLarge,
        abi::LFS_ERR_INVAL => Error::InvalidInput,
        abi::LFS_ERR_NOSPC => Error::NoSpace,
        abi::LFS_ERR_NOMEM => Error::OutOfMemory,
        abi::LFS_ERR_NAMETOOLONG => Error::NameTooLong,
        // Device errors pass through the engine unchanged
        other => Error::from_code(other).unwrap_or(Error::Io),
    }
}

fn check(code: i32) -> Result<i32> {
    if code < 0 {
        Err(error_remap(code))
    } else {
        Ok(code)
    }
}

fn flags_remap(flags: OpenFlags) -> c_int {
    let mut lfs_flags = if flags.contains(OpenFlags::RDWR) {
        abi::LFS_O_RDWR
    } else if flags.contains(OpenFlags::WRONLY) {
        abi::LFS_O_WRONLY
    } else {
        abi::LFS_O_RDONLY
    };
    if flags.contains(OpenFlags::CREAT) {
        lfs_flags |= abi::LFS_O_CREAT;
    }
    if flags.contains(OpenFlags::EXCL) {
        lfs_flags |= abi::LFS_O_EXCL;
    }
    if flags.contains(OpenFlags::TRUNC) {
        lfs_flags |= abi::LFS_O_TRUNC;
    }
    if flags.contains(OpenFlags::APPEND) {
        lfs_flags |= abi::LFS_O_APPEND;
    }
    lfs_flags
}

fn whence_remap(whence: Whence) -> c_int {
    match whence {
        Whence::Set => abi::LFS_SEEK_SET,
        Whence::Cur => abi::LFS_SEEK_CUR,
        Whence::End => abi::LFS_SEEK_END,
    }
}

fn kind_remap(lfs_type: u8) -> EntryKind {
    if lfs_type == abi::LFS_TYPE_DIR {
        EntryKind::Dir
    } else {
        EntryKind::File
    }
}

fn cstring(path: &str) -> Result<CString> {
    CString::new(path).map_err(|_| Error::InvalidInput)
}

/// Target of the engine's block callbacks
struct DeviceCtx {
    device: Arc<dyn BlockDevice>,
    block_size: u32,
}

unsafe extern "C" fn lfs_read_cb(
    c: *const ll::lfs_config,
    block: ll::lfs_block_t,
    off: ll::lfs_off_t,
    buffer: *mut c_void,
    size: ll::lfs_size_t,
) -> c_int {
    let ctx = &*((*c).context as *const DeviceCtx);
    let buf = std::slice::from_raw_parts_mut(buffer as *mut u8, size as usize);
    let addr = block as u64 * ctx.block_size as u64 + off as u64;
    match ctx.device.read(buf, addr) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn lfs_prog_cb(
    c: *const ll::lfs_config,
    block: ll::lfs_block_t,
    off: ll::lfs_off_t,
    buffer: *const c_void,
    size: ll::lfs_size_t,
) -> c_int {
    let ctx = &*((*c).context as *const DeviceCtx);
    let buf = std::slice::from_raw_parts(buffer as *const u8, size as usize);
    let addr = block as u64 * ctx.block_size as u64 + off as u64;
    match ctx.device.program(buf, addr) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn lfs_erase_cb(c: *const ll::lfs_config, block: ll::lfs_block_t) -> c_int {
    let ctx = &*((*c).context as *const DeviceCtx);
    let addr = block as u64 * ctx.block_size as u64;
    match ctx.device.erase(addr, ctx.block_size as u64) {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

unsafe extern "C" fn lfs_sync_cb(c: *const ll::lfs_config) -> c_int {
    let ctx = &*((*c).context as *const DeviceCtx);
    match ctx.device.sync() {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

/// Engine state plus the buffers its config points into.
///
/// Lives in a `Box` so the addresses baked into `config` stay stable.
struct RawLfs {
    lfs: ll::lfs_t,
    config: ll::lfs_config,
    ctx: DeviceCtx,
    read_buf: Vec<u8>,
    prog_buf: Vec<u8>,
    lookahead_buf: Vec<u64>,
}

impl RawLfs {
    /// Build an engine configuration from the device geometry
    fn new(device: Arc<dyn BlockDevice>, config: &LittleFsConfig) -> Box<Self> {
        let geometry = device.geometry();
        let block_size = geometry.erase_size as u32;
        let cache_size = geometry.erase_size;
        let lookahead_size = config.lookahead_size.max(8) / 8 * 8;
        let block_count = (device.size() / block_size as u64) as u32;

        let mut raw = Box::new(RawLfs {
            lfs: unsafe { std::mem::zeroed() },
            config: unsafe { std::mem::zeroed() },
            ctx: DeviceCtx { device, block_size },
            read_buf: vec![0u8; cache_size],
            prog_buf: vec![0u8; cache_size],
            lookahead_buf: vec![0u64; lookahead_size as usize / 8],
        });

        let ctx_ptr = &raw.ctx as *const DeviceCtx as *mut c_void;
        raw.config.context = ctx_ptr;
        raw.config.read = Some(lfs_read_cb);
        raw.config.prog = Some(lfs_prog_cb);
        raw.config.erase = Some(lfs_erase_cb);
        raw.config.sync = Some(lfs_sync_cb);
        raw.config.read_size = geometry.read_size as u32;
        raw.config.prog_size = geometry.program_size as u32;
        raw.config.block_size = block_size;
        raw.config.block_count = block_count;
        raw.config.block_cycles = config.block_cycles;
        raw.config.cache_size = cache_size as u32;
        raw.config.lookahead_size = lookahead_size;
        raw.config.read_buffer = raw.read_buf.as_mut_ptr() as *mut c_void;
        raw.config.prog_buffer = raw.prog_buf.as_mut_ptr() as *mut c_void;
        raw.config.lookahead_buffer = raw.lookahead_buf.as_mut_ptr() as *mut c_void;
        raw
    }
}

/// One open file: engine state, per-file config and its cache buffer.
/// Boxed so the buffer pointer in `config` stays valid.
struct OpenFile {
    file: ll::lfs_file_t,
    config: ll::lfs_file_config,
    cache: Vec<u8>,
}

struct Mounted {
    raw: Box<RawLfs>,
    files: HashMap<usize, Box<OpenFile>>,
    dirs: HashMap<usize, Box<ll::lfs_dir_t>>,
    next_handle: usize,
}

// The raw pointers all target heap allocations owned by this struct, and
// every use is serialized behind the adapter mutex.
unsafe impl Send for Mounted {}

/// littlefs bound to the common [`Filesystem`] interface
pub struct LittleFsFilesystem {
    config: LittleFsConfig,
    state: Mutex<Option<Mounted>>,
}

impl LittleFsFilesystem {
    /// Create an adapter with explicit tunables
    pub fn new(config: LittleFsConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Adapter with the conventional (500, 16) configuration
    pub fn with_defaults() -> Self {
        Self::new(LittleFsConfig::default())
    }
}

impl Default for LittleFsFilesystem {
    fn default() -> Self {
        Self::with_defaults()
    }
}

macro_rules! with_file {
    ($mounted:expr, $handle:expr, |$raw:ident, $file:ident| $body:expr) => {{
        let Mounted {
            raw: $raw, files, ..
        } = $mounted;
        let $file = &mut **files.get_mut(&$handle.raw()).ok_or(Error::BadDescriptor)?;
        $body
    }};
}

impl Filesystem for LittleFsFilesystem {
    fn name(&self) -> &'static str {
        FILESYSTEM_NAME
    }

    fn mount(&self, device: Arc<dyn BlockDevice>, _pending_format: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(Error::Busy);
        }
        device.init()?;

        let mut raw = RawLfs::new(device, &self.config);
        let err = unsafe { ll::lfs_mount(&mut raw.lfs, &raw.config) };
        check(err)?;

        *state = Some(Mounted {
            raw,
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
                "littlefs: unmounting with {} open files, {} open dirs",
                mounted.files.len(),
                mounted.dirs.len()
            );
        }
        let err = unsafe { ll::lfs_unmount(&mut mounted.raw.lfs) };
        check(err)?;
        Ok(())
    }

    fn format(&self, device: Arc<dyn BlockDevice>) -> Result<()> {
        let state = self.state.lock();
        if state.is_some() {
            return Err(Error::Busy);
        }
        scrub_for_format(&*device)?;

        let mut raw = RawLfs::new(device, &self.config);
        let err = unsafe { ll::lfs_format(&mut raw.lfs, &raw.config) };
        check(err)?;
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<()> {
        let path = cstring(path)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        check(unsafe { ll::lfs_remove(&mut mounted.raw.lfs, path.as_ptr()) })?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = cstring(from)?;
        let to = cstring(to)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        check(unsafe { ll::lfs_rename(&mut mounted.raw.lfs, from.as_ptr(), to.as_ptr()) })?;
        Ok(())
    }

    fn mkdir(&self, path: &str, _mode: u32) -> Result<()> {
        let path = cstring(path)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        check(unsafe { ll::lfs_mkdir(&mut mounted.raw.lfs, path.as_ptr()) })?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<()> {
        // littlefs removes empty directories through the remove primitive
        self.remove(path)
    }

    fn stat(&self, path: &str) -> Result<Metadata> {
        let path = cstring(path)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let mut info: ll::lfs_info = unsafe { std::mem::zeroed() };
        check(unsafe { ll::lfs_stat(&mut mounted.raw.lfs, path.as_ptr(), &mut info) })?;
        Ok(Metadata {
            size: info.size as u64,
            kind: kind_remap(info.type_),
            readonly: false,
        })
    }

    fn file_open(&self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let path = cstring(path)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;

        let cache_size = mounted.raw.config.cache_size as usize;
        let mut file = Box::new(OpenFile {
            file: unsafe { std::mem::zeroed() },
            config: unsafe { std::mem::zeroed() },
            cache: vec![0u8; cache_size],
        });
        file.config.buffer = file.cache.as_mut_ptr() as *mut c_void;

        let err = unsafe {
            ll::lfs_file_opencfg(
                &mut mounted.raw.lfs,
                &mut file.file,
                path.as_ptr(),
                flags_remap(flags),
                &file.config,
            )
        };
        check(err)?;

        mounted.next_handle += 1;
        let handle = mounted.next_handle;
        mounted.files.insert(handle, file);
        Ok(FileHandle::from_raw(handle))
    }

    fn file_close(&self, handle: FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let mut file = mounted
            .files
            .remove(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        check(unsafe { ll::lfs_file_close(&mut mounted.raw.lfs, &mut file.file) })?;
        Ok(())
    }

    fn file_read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            let n = unsafe {
                ll::lfs_file_read(
                    &mut raw.lfs,
                    &mut file.file,
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len() as ll::lfs_size_t,
                )
            };
            check(n).map(|n| n as usize)
        })
    }

    fn file_write(&self, handle: FileHandle, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            let n = unsafe {
                ll::lfs_file_write(
                    &mut raw.lfs,
                    &mut file.file,
                    buf.as_ptr() as *const c_void,
                    buf.len() as ll::lfs_size_t,
                )
            };
            check(n).map(|n| n as usize)
        })
    }

    fn file_sync(&self, handle: FileHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            check(unsafe { ll::lfs_file_sync(&mut raw.lfs, &mut file.file) })?;
            Ok(())
        })
    }

    fn file_seek(&self, handle: FileHandle, offset: i64, whence: Whence) -> Result<u64> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            let pos = unsafe {
                ll::lfs_file_seek(
                    &mut raw.lfs,
                    &mut file.file,
                    offset as ll::lfs_soff_t,
                    whence_remap(whence),
                )
            };
            check(pos).map(|pos| pos as u64)
        })
    }

    fn file_tell(&self, handle: FileHandle) -> Result<u64> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            let pos = unsafe { ll::lfs_file_tell(&mut raw.lfs, &mut file.file) };
            check(pos).map(|pos| pos as u64)
        })
    }

    fn file_size(&self, handle: FileHandle) -> Result<u64> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            let size = unsafe { ll::lfs_file_size(&mut raw.lfs, &mut file.file) };
            check(size).map(|size| size as u64)
        })
    }

    fn file_truncate(&self, handle: FileHandle, length: u64) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        with_file!(mounted, handle, |raw, file| {
            check(unsafe {
                ll::lfs_file_truncate(&mut raw.lfs, &mut file.file, length as ll::lfs_off_t)
            })?;
            Ok(())
        })
    }

    fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let path = cstring(path)?;
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;

        let mut dir: Box<ll::lfs_dir_t> = Box::new(unsafe { std::mem::zeroed() });
        check(unsafe { ll::lfs_dir_open(&mut mounted.raw.lfs, &mut *dir, path.as_ptr()) })?;

        mounted.next_handle += 1;
        let handle = mounted.next_handle;
        mounted.dirs.insert(handle, dir);
        Ok(DirHandle::from_raw(handle))
    }

    fn dir_close(&self, handle: DirHandle) -> Result<()> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let mut dir = mounted
            .dirs
            .remove(&handle.raw())
            .ok_or(Error::BadDescriptor)?;
        check(unsafe { ll::lfs_dir_close(&mut mounted.raw.lfs, &mut *dir) })?;
        Ok(())
    }

    fn dir_read(&self, handle: DirHandle) -> Result<Option<Dirent>> {
        let mut state = self.state.lock();
        let mounted = state.as_mut().ok_or(Error::NoDevice)?;
        let Mounted { raw, dirs, .. } = mounted;
        let dir = dirs.get_mut(&handle.raw()).ok_or(Error::BadDescriptor)?;

        let mut info: ll::lfs_info = unsafe { std::mem::zeroed() };
        let res = unsafe { ll::lfs_dir_read(&mut raw.lfs, &mut **dir, &mut info) };
        match check(res)? {
            0 => Ok(None),
            _ => {
                let name = unsafe { std::ffi::CStr::from_ptr(info.name.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();
                Ok(Some(Dirent {
                    name,
                    kind: kind_remap(info.type_),
                }))
            }
        }
    }
}

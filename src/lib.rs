//! mcufs - portable virtual filesystem for microcontroller storage
//!
//! Mount one or more filesystems - each backed by a pluggable block
//! device (on-chip flash, SD card over SPI, RAM, or a loopback image
//! file) - under a shared namespace rooted at `/`, and operate on them
//! through a POSIX-style descriptor surface or the native abstractions.
//!
//! This crate is a facade over the workspace members:
//!
//! - [`mcufs_core`]: the [`BlockDevice`](blockdevice::BlockDevice) and
//!   [`Filesystem`](filesystem::Filesystem) traits, the shared error
//!   space and the [`Vfs`](vfs::Vfs) multiplexer
//! - [`mcufs_flash`], [`mcufs_heap`], [`mcufs_loopback`], [`mcufs_sd`]:
//!   block devices
//! - [`mcufs_fat`], [`mcufs_littlefs`]: filesystem adapters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcufs::filesystem::{MountFlags, OpenFlags};
//! use mcufs::vfs::Vfs;
//! use mcufs::{FlashDevice, LittleFsFilesystem, RamFlash};
//!
//! # fn main() -> mcufs::Result<()> {
//! let vfs = Vfs::new();
//! let device = Arc::new(FlashDevice::new(RamFlash::new(2 * 1024 * 1024), 0, 0)?);
//! let fs = Arc::new(LittleFsFilesystem::with_defaults());
//! vfs.mount("/", fs, device, MountFlags::AUTO_FORMAT)?;
//!
//! let fd = vfs.open("/hello.txt", OpenFlags::WRONLY | OpenFlags::CREAT)?;
//! vfs.write(fd, b"Hello World!\n")?;
//! vfs.close(fd)?;
//! # Ok(())
//! # }
//! ```

pub use mcufs_core::blockdevice;
pub use mcufs_core::clock;
pub use mcufs_core::filesystem;
pub use mcufs_core::vfs;
pub use mcufs_core::{Error, Result};

pub use mcufs_fat::FatFilesystem;
pub use mcufs_flash::{FlashController, FlashDevice, RamFlash};
pub use mcufs_heap::HeapDevice;
pub use mcufs_littlefs::{LittleFsConfig, LittleFsFilesystem};
pub use mcufs_loopback::LoopbackDevice;
pub use mcufs_sd::{SdConfig, SdDevice, SpiBus};

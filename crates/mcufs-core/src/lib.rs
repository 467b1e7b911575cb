//! mcufs-core - Block device and filesystem abstractions plus the VFS
//!
//! This crate defines the two capability interfaces every storage backend
//! plugs into - [`blockdevice::BlockDevice`] for raw media and
//! [`filesystem::Filesystem`] for mounted volumes - together with the
//! [`vfs::Vfs`] multiplexer that grafts mounted filesystems into a single
//! namespace and exposes a POSIX-style descriptor surface.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcufs_core::filesystem::{MountFlags, OpenFlags};
//! use mcufs_core::vfs::Vfs;
//!
//! let vfs = Vfs::new();
//! vfs.mount("/", fs, device, MountFlags::AUTO_FORMAT)?;
//!
//! let fd = vfs.open("/hello.txt", OpenFlags::WRONLY | OpenFlags::CREAT)?;
//! vfs.write(fd, b"Hello World!\n")?;
//! vfs.close(fd)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdevice;
pub mod clock;
pub mod error;
pub mod filesystem;
pub mod vfs;

pub use error::{Error, Result};

//! mcufs-loopback - File-backed block device
//!
//! Stores device blocks in a regular file of another mounted filesystem,
//! so a second filesystem can be mounted on top of an image file. The
//! backing I/O goes through the VFS, which must therefore be the reentrant
//! multiplexer from `mcufs-core`.

pub mod device;

pub use device::LoopbackDevice;

//! mcufs-heap - RAM-backed block device
//!
//! A block device whose storage is a heap buffer. Useful as scratch media
//! for tests and as the backing store of temporary filesystems. Erased
//! blocks read back as 0xFF, mirroring NOR flash, so filesystems formatted
//! on heap behave like they do on real media.

pub mod device;

pub use device::{HeapDevice, HEAP_BLOCK_SIZE, HEAP_ERASE_VALUE};

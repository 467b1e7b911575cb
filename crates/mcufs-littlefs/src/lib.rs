//! mcufs-littlefs - littlefs filesystem adapter
//!
//! Glue between the upstream littlefs engine and the common filesystem
//! interface: the engine configuration is rebuilt from the block device's
//! geometry on every mount and format, POSIX open flags and seek origins
//! are remapped to the engine's, and the engine's error codes are remapped
//! onto the shared negative space. Device errors surfaced inside engine
//! callbacks pass through unchanged.

pub mod filesystem;

pub use filesystem::{LittleFsConfig, LittleFsFilesystem};

//! mcufs-flash - On-chip flash window block device
//!
//! Exposes a window of the on-chip flash bank as a block device. The
//! platform side sits behind the [`FlashController`] trait: reads are
//! plain loads from the XIP-mapped window, while program and erase must
//! run with every other execution context off the flash - either through
//! a safe-execute primitive that parks other cores in RAM (whose failure
//! modes are reported distinctly) or by disabling interrupts on
//! single-core deployments.
//!
//! [`RamFlash`] provides an in-memory controller with NOR semantics for
//! tests and host development.

pub mod controller;
pub mod device;
pub mod error;

pub use controller::{FlashController, RamFlash, FLASH_PAGE_SIZE, FLASH_SECTOR_SIZE};
pub use device::FlashDevice;
pub use error::{FlashError, Result};

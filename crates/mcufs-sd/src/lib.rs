//! mcufs-sd - SD/MMC card block device over SPI
//!
//! A blocking SPI-mode driver for SD and MMC cards. The board layer
//! provides the SPI peripheral and chip select behind the [`SpiBus`]
//! trait; the driver owns the command protocol: the power-on handshake,
//! single and multiple block transfers, the erase command sequence, CRC
//! generation and checking, and CSD capacity decoding.
//!
//! Errors map onto the reserved -5001..-5011 range of the shared error
//! space. The [`mock`] module contains an in-memory card emulator that
//! speaks the same wire protocol, used by the driver's own tests.

pub mod bus;
pub mod crc;
pub mod device;
pub mod error;
pub mod mock;
pub mod protocol;

pub use bus::SpiBus;
pub use device::{SdConfig, SdDevice, INIT_CLOCK_HZ, TRANSFER_CLOCK_MAX_HZ};
pub use error::SdError;
pub use protocol::CardType;

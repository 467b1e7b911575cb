//! Error types for the SD/MMC driver

use thiserror::Error;

/// SD card failures, mapped onto the reserved -5001..-5011 code range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SdError {
    /// Operation would block
    #[error("operation would block")]
    WouldBlock,

    /// Operation or command not supported by the card
    #[error("operation not supported")]
    Unsupported,

    /// Address or size out of range or misaligned
    #[error("invalid parameter")]
    Parameter,

    /// Card has not been initialized
    #[error("card not initialized")]
    NoInit,

    /// Card is missing or not connected
    #[error("no device or card missing")]
    NoDevice,

    /// Card is write protected
    #[error("card is write protected")]
    WriteProtected,

    /// Card is unusable (unsupported voltage range or broken handshake)
    #[error("card unusable")]
    Unusable,

    /// No response from the card
    #[error("no response from card")]
    NoResponse,

    /// Data CRC mismatch
    #[error("CRC error")]
    Crc,

    /// Erase reset or sequence error reported by the card
    #[error("erase error")]
    Erase,

    /// Data response token signalled a rejected write
    #[error("write not accepted")]
    Write,
}

impl From<SdError> for mcufs_core::Error {
    fn from(err: SdError) -> Self {
        match err {
            SdError::WouldBlock => mcufs_core::Error::SdWouldBlock,
            SdError::Unsupported => mcufs_core::Error::SdUnsupported,
            SdError::Parameter => mcufs_core::Error::SdParameter,
            SdError::NoInit => mcufs_core::Error::SdNoInit,
            SdError::NoDevice => mcufs_core::Error::SdNoDevice,
            SdError::WriteProtected => mcufs_core::Error::SdWriteProtected,
            SdError::Unusable => mcufs_core::Error::SdUnusable,
            SdError::NoResponse => mcufs_core::Error::SdNoResponse,
            SdError::Crc => mcufs_core::Error::SdCrc,
            SdError::Erase => mcufs_core::Error::SdErase,
            SdError::Write => mcufs_core::Error::SdWrite,
        }
    }
}

/// Result type for SD driver internals
pub type Result<T> = core::result::Result<T, SdError>;

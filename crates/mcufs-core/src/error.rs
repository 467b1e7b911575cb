//! Unified error space shared by block devices, filesystem adapters and the VFS.
//!
//! Three disjoint ranges coexist: POSIX-like codes (small negative errno
//! values), flash controller codes (-4001..-4003) and SD card codes
//! (-5001..-5011). Adapters remap their engine's errors onto this space;
//! the VFS hands the codes to callers unchanged.

use core::fmt;

/// Error type shared across the whole stack - `Copy` for cheap propagation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // POSIX-like errors
    /// Low-level I/O failure
    Io,
    /// No such file or directory
    NotFound,
    /// A path component is not a directory
    NotADirectory,
    /// The path names a directory where a file was expected
    IsADirectory,
    /// Access denied by the filesystem
    PermissionDenied,
    /// Invalid argument (bad path, bad flags, misaligned address)
    InvalidInput,
    /// File or directory already exists
    AlreadyExists,
    /// Descriptor is not open
    BadDescriptor,
    /// No such device or volume
    NoDevice,
    /// Operation timed out
    TimedOut,
    /// Resource busy or locked
    Busy,
    /// Allocation failed
    OutOfMemory,
    /// Descriptor table exhausted
    TooManyOpenFiles,
    /// Directory is not empty
    NotEmpty,
    /// No space left on the filesystem
    NoSpace,
    /// Rename across different mountpoints
    CrossDevice,
    /// File name exceeds the engine's limit
    NameTooLong,
    /// File exceeds the engine's maximum size
    FileTooLarge,
    /// On-disk structures are corrupted
    CorruptedData,

    // Flash controller errors
    /// Flash safe-execute primitive timed out
    FlashTimeout,
    /// Flash safe-execute was not permitted in the current state
    FlashNotPermitted,
    /// Flash safe-execute lacked resources to park other cores
    FlashInsufficientResources,

    // SD card errors
    /// SD operation would block
    SdWouldBlock,
    /// SD operation or command not supported by the card
    SdUnsupported,
    /// SD address or size out of range or misaligned
    SdParameter,
    /// SD card not initialized
    SdNoInit,
    /// SD card missing or not connected
    SdNoDevice,
    /// SD card is write protected
    SdWriteProtected,
    /// SD card unusable (voltage range or broken handshake)
    SdUnusable,
    /// No response from the SD card
    SdNoResponse,
    /// SD data CRC mismatch
    SdCrc,
    /// SD erase sequence error
    SdErase,
    /// SD write was not accepted by the card
    SdWrite,
}

impl Error {
    /// Negative domain code carried by this error.
    ///
    /// POSIX-like variants use conventional errno magnitudes; flash and SD
    /// variants use their reserved -4000/-5000 ranges.
    pub fn code(&self) -> i32 {
        match self {
            Self::Io => -5,
            Self::NotFound => -2,
            Self::NotADirectory => -20,
            Self::IsADirectory => -21,
            Self::InvalidInput => -22,
            Self::PermissionDenied => -13,
            Self::AlreadyExists => -17,
            Self::BadDescriptor => -9,
            Self::NoDevice => -19,
            Self::TimedOut => -110,
            Self::Busy => -16,
            Self::OutOfMemory => -12,
            Self::TooManyOpenFiles => -23,
            Self::NotEmpty => -39,
            Self::NoSpace => -28,
            Self::CrossDevice => -18,
            Self::NameTooLong => -36,
            Self::FileTooLarge => -27,
            Self::CorruptedData => -84,
            Self::FlashTimeout => -4001,
            Self::FlashNotPermitted => -4002,
            Self::FlashInsufficientResources => -4003,
            Self::SdWouldBlock => -5001,
            Self::SdUnsupported => -5002,
            Self::SdParameter => -5003,
            Self::SdNoInit => -5004,
            Self::SdNoDevice => -5005,
            Self::SdWriteProtected => -5006,
            Self::SdUnusable => -5007,
            Self::SdNoResponse => -5008,
            Self::SdCrc => -5009,
            Self::SdErase => -5010,
            Self::SdWrite => -5011,
        }
    }

    /// Reconstruct an error from its negative domain code.
    ///
    /// Lets a code that crossed a foreign boundary (an engine callback
    /// returning device errors) round-trip back into the typed space.
    pub fn from_code(code: i32) -> Option<Self> {
        let all = [
            Self::Io,
            Self::NotFound,
            Self::NotADirectory,
            Self::IsADirectory,
            Self::PermissionDenied,
            Self::InvalidInput,
            Self::AlreadyExists,
            Self::BadDescriptor,
            Self::NoDevice,
            Self::TimedOut,
            Self::Busy,
            Self::OutOfMemory,
            Self::TooManyOpenFiles,
            Self::NotEmpty,
            Self::NoSpace,
            Self::CrossDevice,
            Self::NameTooLong,
            Self::FileTooLarge,
            Self::CorruptedData,
            Self::FlashTimeout,
            Self::FlashNotPermitted,
            Self::FlashInsufficientResources,
            Self::SdWouldBlock,
            Self::SdUnsupported,
            Self::SdParameter,
            Self::SdNoInit,
            Self::SdNoDevice,
            Self::SdWriteProtected,
            Self::SdUnusable,
            Self::SdNoResponse,
            Self::SdCrc,
            Self::SdErase,
            Self::SdWrite,
        ];
        all.into_iter().find(|e| e.code() == code)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(strerror(self.code()))
    }
}

impl std::error::Error for Error {}

/// Result type alias using the shared error
pub type Result<T> = core::result::Result<T, Error>;

/// Human-readable message for a negative domain code.
///
/// The code space is partitioned: -5001..-5011 are SD card errors,
/// -4001..-4003 are flash controller errors, anything else is treated as a
/// POSIX errno magnitude.
pub fn strerror(code: i32) -> &'static str {
    match code {
        -5001 => "SD operation would block",
        -5002 => "SD operation not supported",
        -5003 => "SD invalid parameter",
        -5004 => "SD card not initialized",
        -5005 => "SD card missing or not connected",
        -5006 => "SD card is write protected",
        -5007 => "SD card unusable",
        -5008 => "no response from SD card",
        -5009 => "SD data CRC error",
        -5010 => "SD erase error",
        -5011 => "SD write error",
        -4001 => "flash safe-execute timeout",
        -4002 => "flash operation not permitted",
        -4003 => "flash insufficient resources",
        -2 => "No such file or directory",
        -5 => "Input/output error",
        -9 => "Bad file descriptor",
        -12 => "Cannot allocate memory",
        -13 => "Permission denied",
        -16 => "Device or resource busy",
        -17 => "File exists",
        -18 => "Invalid cross-device link",
        -19 => "No such device",
        -20 => "Not a directory",
        -21 => "Is a directory",
        -22 => "Invalid argument",
        -23 => "Too many open files in system",
        -27 => "File too large",
        -28 => "No space left on device",
        -36 => "File name too long",
        -39 => "Directory not empty",
        -84 => "Invalid or incomplete multibyte or wide character",
        -110 => "Connection timed out",
        0 => "Success",
        _ => "Unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_ranges_are_disjoint() {
        let sd = [
            Error::SdWouldBlock,
            Error::SdUnsupported,
            Error::SdParameter,
            Error::SdNoInit,
            Error::SdNoDevice,
            Error::SdWriteProtected,
            Error::SdUnusable,
            Error::SdNoResponse,
            Error::SdCrc,
            Error::SdErase,
            Error::SdWrite,
        ];
        for (i, e) in sd.iter().enumerate() {
            assert_eq!(e.code(), -5001 - i as i32);
        }

        assert_eq!(Error::FlashTimeout.code(), -4001);
        assert_eq!(Error::FlashNotPermitted.code(), -4002);
        assert_eq!(Error::FlashInsufficientResources.code(), -4003);

        assert_eq!(Error::NotFound.code(), -2);
        assert_eq!(Error::Io.code(), -5);
    }

    #[test]
    fn test_strerror_partitions() {
        assert_eq!(strerror(-5009), "SD data CRC error");
        assert_eq!(strerror(-4001), "flash safe-execute timeout");
        assert_eq!(strerror(-2), "No such file or directory");
        assert_eq!(strerror(-9999), "Unknown error");
    }
}

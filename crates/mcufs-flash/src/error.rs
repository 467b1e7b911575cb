//! Error types for flash controller operations

use thiserror::Error;

/// Failures of the flash program/erase path.
///
/// Programming on-chip flash requires that no other execution context
/// touches the flash while it runs; controllers that park other cores
/// through a safe-execute primitive report its failure modes distinctly so
/// applications can retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Safe-execute timed out waiting for other cores to park
    #[error("flash safe-execute timeout")]
    Timeout,

    /// Safe-execute is not permitted in the current controller state
    #[error("flash operation not permitted")]
    NotPermitted,

    /// Safe-execute could not allocate the resources to park other cores
    #[error("flash insufficient resources")]
    InsufficientResources,

    /// Address or length outside the controller's capacity
    #[error("flash address out of bounds")]
    OutOfBounds,
}

impl From<FlashError> for mcufs_core::Error {
    fn from(err: FlashError) -> Self {
        match err {
            FlashError::Timeout => mcufs_core::Error::FlashTimeout,
            FlashError::NotPermitted => mcufs_core::Error::FlashNotPermitted,
            FlashError::InsufficientResources => mcufs_core::Error::FlashInsufficientResources,
            FlashError::OutOfBounds => mcufs_core::Error::InvalidInput,
        }
    }
}

/// Result type for flash controller operations
pub type Result<T> = core::result::Result<T, FlashError>;

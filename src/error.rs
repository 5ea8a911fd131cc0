//! Error types for amp_link

use std::io;
use thiserror::Error;

/// Result type for amp_link operations
pub type Result<T> = std::result::Result<T, AmpError>;

/// Errors that can occur on either side of the inter-core link
#[derive(Debug, Error)]
pub enum AmpError {
    /// Operation invoked on the wrong role or core
    #[error("Operation not supported on this side")]
    NotSupported,

    /// Protocol sequencing violation (free before recv, send before alloc)
    #[error("Operation not allowed in the current protocol state")]
    NotAllowed,

    /// No available slot, endpoint, service or sys-info entry
    #[error("Not found")]
    NotFound,

    /// Requested size exceeds the configured capacity
    #[error("Size exceeds capacity: max {max} bytes, got {got} bytes")]
    NoMem { max: usize, got: usize },

    /// Null, zero-length or out-of-range input
    #[error("Invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Duplicate registration
    #[error("Already exists")]
    Exist,

    /// Deadline elapsed
    #[error("Timed out after {0} ms")]
    Timeout(u32),

    /// Operation on a deinitialized instance
    #[error("Instance is not running")]
    InvalidState,

    /// Ring invariant broken; the transport must be treated as unusable
    #[error("Transport broken: {0}")]
    Transport(&'static str),

    /// Failed to create shared memory
    #[error("Failed to create shared memory '{name}': {source}")]
    ShmCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to open shared memory
    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Namespace too long
    #[error("Namespace too long: max {max} chars, got {got}")]
    NamespaceTooLong { max: usize, got: usize },

    /// Failed to start a worker thread
    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    /// Shared region cannot hold the reserved header and pool
    #[error("Shared region too small: need at least {min} bytes, got {got}")]
    RegionTooSmall { min: usize, got: usize },
}

impl AmpError {
    /// Whether the condition is transient and worth retrying on the next poll tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmpError::NotFound | AmpError::NoMem { .. } | AmpError::Timeout(_)
        )
    }
}

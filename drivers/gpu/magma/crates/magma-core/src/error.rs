//! # MAGMA Error Handling
//!
//! Error kinds reported by the TSG scheduler and the channel-sync layer.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized, never raw errno values
//! - No panics in production code paths
//! - Only [`Error::Retry`] is meant to be retried, and only by the caller
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// A fixed pool or a per-TSG limit is exhausted
    ResourceExhausted,
    /// Operation issued in the wrong sequence (already bound, no domain, ...)
    InvalidState,
    /// Channel runlist disagrees with the runlist of the TSG
    Mismatch,
    /// Argument out of range or malformed
    InvalidArgument,
    /// Configuration not usable (zero SM count, inverted bounds, ...)
    InvalidConfig,
    /// Hardware not ready yet; the same call may be retried
    Retry,

    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Operation not supported by this device or build
    NotSupported,
    /// Named resource not found
    NotFound,
    /// Out of system memory
    OutOfMemory,
    /// Operation timed out
    Timeout,

    // =========================================================================
    // Hardware / Command Errors
    // =========================================================================
    /// Private command buffer has no room for the request
    CommandBufferFull,
    /// GPU device is in a bad state
    GpuFault,
}

impl Error {
    /// Whether the caller may retry the failed operation unchanged
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Scheduling
            Self::ResourceExhausted => write!(f, "resource exhausted"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Mismatch => write!(f, "runlist mismatch"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidConfig => write!(f, "invalid configuration"),
            Self::Retry => write!(f, "hardware busy, try again"),

            // Generic
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotFound => write!(f, "resource not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Timeout => write!(f, "operation timed out"),

            // Hardware
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::GpuFault => write!(f, "GPU fault detected"),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

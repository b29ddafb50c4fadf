//! # Rocket Error Handling
//!
//! One error type for the whole job core.
//!
//! Construction-time failures (`InvalidArgument`, `ResourceFault`, `NoMemory`)
//! are returned to the submitter after all partial ownership has been
//! released. Hang handling never reaches the submitter directly: it shows up
//! as the error state of a Job's finished token.

use alloc::collections::TryReserveError;
use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Rocket Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Rocket unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// Malformed task or job description
    InvalidArgument,
    /// Buffer lookup or dependency-slot reservation failed
    ResourceFault,
    /// Task or job array allocation failed
    NoMemory,
    /// Handle does not name a live object
    NotFound,

    // =========================================================================
    // Wait Errors
    // =========================================================================
    /// Wait budget expired before the token signaled
    Timeout,
    /// Non-blocking query found pending work
    Busy,

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Timeout confirmed after interrupt resynchronization
    HangDetected,
    /// Timeout fired but the job had already completed
    SpuriousTimeout,
    /// Job was torn down before reaching the hardware
    Canceled,
    /// Power or IOMMU collaborator refused to bring the engine up
    DeviceFault,
}

impl Error {
    /// Negative errno value handed back through the ioctl layer
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => -22,
            Self::ResourceFault => -14,
            Self::NoMemory => -12,
            Self::NotFound => -2,
            Self::Timeout => -110,
            Self::Busy => -16,
            Self::HangDetected => -62,
            Self::SpuriousTimeout => -11,
            Self::Canceled => -125,
            Self::DeviceFault => -5,
        }
    }

    /// Whether the error is raised before any resource is touched
    pub const fn is_construction(self) -> bool {
        matches!(
            self,
            Self::InvalidArgument | Self::ResourceFault | Self::NoMemory | Self::NotFound
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::ResourceFault => write!(f, "buffer resource fault"),
            Self::NoMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "object not found"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::Busy => write!(f, "resource busy"),
            Self::HangDetected => write!(f, "engine hang detected"),
            Self::SpuriousTimeout => write!(f, "spurious job timeout"),
            Self::Canceled => write!(f, "job canceled"),
            Self::DeviceFault => write!(f, "device fault"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::NoMemory
    }
}

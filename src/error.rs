//! Error types for aqueduct.

use thiserror::Error;

/// Result type alias using aqueduct's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for aqueduct operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Backing memory could not be created or mapped.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A reader or writer failed mid-stream. The component is latched in
    /// the failed state and can only be closed.
    #[error("{0} failed and can only be closed")]
    Stream(String),

    /// The operation is not valid in the component's current state.
    #[error("invalid operation: {0}")]
    Precondition(String),

    /// A seek request was rejected. The component is left in an
    /// undefined state and must be closed.
    #[error("seek rejected: {0}")]
    Seek(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

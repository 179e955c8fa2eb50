//! # Errors
//!
//! Domain error kinds shared by the geometry, store, method and scheduling layers.
//! Job bodies use `anyhow` and are converted to a recorded failure at the queue boundary.

use thiserror::Error;

/// Result alias for smartfire operations
pub type Result<T> = std::result::Result<T, SmartfireError>;

/// Main error type for smartfire operations
#[derive(Error, Debug)]
pub enum SmartfireError {
    /// A precondition on an argument was violated (empty input, missing shape, unknown name)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A geometry of the wrong kind was handed to a coercion
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Events from different reconciliation streams cannot be merged
    #[error("Incompatible streams for merged Event: {0} and {1}")]
    IncompatibleStreams(String, String),

    /// Store or geometry backend failure
    #[error("store error: {0}")]
    Store(String),

    /// The job queue no longer accepts work
    #[error("job queue has been disposed")]
    QueueDisposed,

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl SmartfireError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

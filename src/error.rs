//! Error types for KissDB

use thiserror::Error;

use crate::store::path::Level;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in KissDB
#[derive(Error, Debug)]
pub enum Error {
    /// Path is malformed, too deep, or addresses the wrong level
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Database, table or box already exists
    #[error("{} already exists.", .0.title())]
    AlreadyExists(Level),

    /// The most specific missing level of a path
    #[error("{} does not exist.", .0.title())]
    NotFound(Level),

    /// A blocked read exceeded the request timeout
    #[error("Timed out after {0:?} waiting for the journal")]
    Timeout(std::time::Duration),

    /// Filesystem or permission failure while applying a journal entry
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Coarse classification of [`Error`] used by the HTTP layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidPath,
    AlreadyExists,
    NotFound,
    Timeout,
    Internal,
}

impl Error {
    /// Project onto the engine's error taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPath(_) => ErrorKind::InvalidPath,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Internal(_) | Error::Io(_) | Error::Config(_) | Error::Metrics(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true if this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl ErrorKind {
    /// HTTP status code for this kind of failure
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::InvalidPath => 400,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::NotFound => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Internal => 500,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

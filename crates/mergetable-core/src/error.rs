//! Error types for mergetable.

use std::fmt;
use std::path::PathBuf;

/// The main error type for mergetable operations.
#[derive(Debug)]
pub enum Error {
    /// I/O error (open, stat, truncate, seek, read, write)
    Io(std::io::Error),

    /// On-disk state cannot be trusted: bad magic, checksum mismatch,
    /// non-contiguous provenance ranges, truncated structures
    Corrupt(String),

    /// A caller-supplied argument or option was rejected
    InvalidArgument(String),

    /// The table directory exists but the open mode required a new one
    AlreadyExists(PathBuf),

    /// The table directory is missing but the open mode required an existing one
    NotFound(PathBuf),

    /// Another handle holds the table's directory lock
    LockHeld(PathBuf),

    /// Serialization error
    Serialization(String),

    /// A lock was poisoned (internal error)
    LockPoisoned,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Corrupt(msg) => write!(f, "Corrupt table: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::AlreadyExists(path) => write!(f, "Table already exists: {}", path.display()),
            Error::NotFound(path) => write!(f, "Table not found: {}", path.display()),
            Error::LockHeld(path) => write!(f, "Table is locked: {}", path.display()),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::LockPoisoned => write!(f, "Lock poisoned"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    /// Returns true for errors that mean the on-disk state is unusable.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }
}

/// A specialized `Result` type for mergetable operations.
pub type Result<T> = std::result::Result<T, Error>;

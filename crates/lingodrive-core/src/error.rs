//! Error types for lingodrive

use std::fmt;

use thiserror::Error;

/// Why a drive key was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidKeyReason {
    /// Empty or whitespace-only input
    Empty,
    /// Odd length or non-hex characters
    Malformed,
    /// Well-formed hex, but not the 32 bytes a replicated drive is addressed by
    WrongLength {
        /// Required byte length
        expected: usize,
        /// Decoded byte length
        actual: usize,
    },
}

impl fmt::Display for InvalidKeyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidKeyReason::Empty => write!(f, "empty"),
            InvalidKeyReason::Malformed => write!(f, "malformed"),
            InvalidKeyReason::WrongLength { expected, actual } => {
                write!(f, "wrong length (expected {} bytes, got {})", expected, actual)
            }
        }
    }
}

/// Main error type for lingodrive operations
#[derive(Error, Debug)]
pub enum DriveError {
    /// User supplied a drive key that cannot be used
    #[error("InvalidKey: {0}")]
    InvalidKey(InvalidKeyReason),

    /// The environment lacks the peer-to-peer primitives
    #[error("Peer-to-peer modules unavailable: {0}")]
    ModuleUnavailable(String),

    /// Swarm join or drive handshake failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Requested path is absent from the drive or the local fallback
    #[error("Not found: {0}")]
    NotFound(String),

    /// A single mirror pass failed
    #[error("Mirror pass failed: {0}")]
    SyncPass(String),

    /// Operation on a session that has been closed
    #[error("Drive session closed")]
    SessionClosed,

    /// Manifest signature or content did not verify
    #[error("Signature invalid: {0}")]
    Signature(String),

    /// Error during block store operations (iroh-blobs)
    #[error("Blob error: {0}")]
    Blob(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DriveError {
    /// Errors a user can fix by retrying the connect, possibly with the same key
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriveError::Connection(_) | DriveError::Timeout(_) | DriveError::Network(_)
        )
    }

    /// Errors caused by user input rather than the environment
    pub fn is_user_error(&self) -> bool {
        matches!(self, DriveError::InvalidKey(_))
    }
}

/// Result type alias using DriveError
pub type DriveResult<T> = Result<T, DriveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriveError::InvalidKey(InvalidKeyReason::Empty);
        assert_eq!(format!("{}", err), "InvalidKey: empty");

        let err = DriveError::InvalidKey(InvalidKeyReason::Malformed);
        assert_eq!(format!("{}", err), "InvalidKey: malformed");
    }

    #[test]
    fn test_wrong_length_display() {
        let err = DriveError::InvalidKey(InvalidKeyReason::WrongLength {
            expected: 32,
            actual: 4,
        });
        assert!(err.to_string().contains("expected 32 bytes, got 4"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DriveError = io_err.into();
        assert!(matches!(err, DriveError::Io(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DriveError::Connection("no route".into()).is_retryable());
        assert!(DriveError::Timeout("ready".into()).is_retryable());
        assert!(!DriveError::InvalidKey(InvalidKeyReason::Malformed).is_retryable());
        assert!(DriveError::InvalidKey(InvalidKeyReason::Malformed).is_user_error());
        assert!(!DriveError::SessionClosed.is_user_error());
    }
}

//! Error taxonomy shared by every nimbus crate.
//!
//! [`ClientError`] is what the cloud client collaborator reports and what
//! flows through asynchronous completions. Filesystem-facing layers map it to
//! the nearest POSIX error code through [`ToErrno`].

use std::io;
use thiserror::Error;

/// Errors reported by the cloud client and by asynchronous completions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The node does not exist (or no longer exists).
    #[error("node not found")]
    NotFound,

    /// A node with that name already exists.
    #[error("node already exists")]
    Exists,

    /// The node was expected to be a directory.
    #[error("node is not a directory")]
    NotDirectory,

    /// The node was expected to be a file.
    #[error("node is a directory")]
    IsDirectory,

    /// The directory still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// The caller lacks access to the node.
    #[error("permission denied")]
    PermissionDenied,

    /// The node or mount is read-only.
    #[error("read-only")]
    ReadOnly,

    /// The resource is in use.
    #[error("resource busy")]
    Busy,

    /// The request was cancelled before it could complete.
    #[error("cancelled")]
    Cancelled,

    /// A transient failure (network error, timeout); the request may be retried.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A permanent failure.
    #[error("failed: {0}")]
    Failed(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }

    /// Whether this error reports a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}

impl ToErrno for ClientError {
    fn to_errno(&self) -> i32 {
        match self {
            ClientError::NotFound => libc::ENOENT,
            ClientError::Exists => libc::EEXIST,
            ClientError::NotDirectory => libc::ENOTDIR,
            ClientError::IsDirectory => libc::EISDIR,
            ClientError::NotEmpty => libc::ENOTEMPTY,
            ClientError::PermissionDenied => libc::EACCES,
            ClientError::ReadOnly => libc::EROFS,
            ClientError::Busy => libc::EBUSY,
            ClientError::Cancelled => libc::ECANCELED,
            ClientError::Transient(_) => libc::EAGAIN,
            ClientError::Failed(_) => libc::EIO,
            ClientError::InvalidArgument(_) => libc::EINVAL,
        }
    }
}

/// Result of a client operation.
pub type ErrorOr<T> = Result<T, ClientError>;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// SQLite reported an error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A query referenced a parameter it does not declare.
    #[error("unknown query parameter: {0}")]
    UnknownParameter(String),

    /// A query asked for a column the result set does not have.
    #[error("unknown field: {0}")]
    UnknownField(String),

    /// A field was read while no row was current.
    #[error("query has no current row")]
    NoRow,
}

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        if let Some(code) = self.raw_os_error() {
            return code;
        }
        match self.kind() {
            io::ErrorKind::NotFound => libc::ENOENT,
            io::ErrorKind::PermissionDenied => libc::EACCES,
            io::ErrorKind::AlreadyExists => libc::EEXIST,
            io::ErrorKind::InvalidInput => libc::EINVAL,
            io::ErrorKind::TimedOut => libc::ETIMEDOUT,
            io::ErrorKind::WouldBlock => libc::EAGAIN,
            _ => libc::EIO,
        }
    }
}

impl ToErrno for DatabaseError {
    fn to_errno(&self) -> i32 {
        libc::EIO
    }
}

//! Error types for the file service.

use nimbus_core::{Cancelled, ClientError, DatabaseError, FileID, ToErrno};
use std::io;
use thiserror::Error;

/// Outcome of a single file request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileError {
    /// The request was abandoned before it could finish.
    #[error("request cancelled")]
    Cancelled,

    /// Local storage or bookkeeping failed.
    #[error("request failed: {0}")]
    Failed(String),

    /// The file has been removed.
    #[error("file has been removed")]
    Removed,

    /// The request's arguments are invalid.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The file cannot be modified.
    #[error("file is read-only")]
    ReadOnly,

    /// The cloud client reported an error.
    #[error("client error: {0}")]
    Client(ClientError),
}

impl Cancelled for FileError {
    fn cancelled() -> Self {
        FileError::Cancelled
    }
}

impl From<ClientError> for FileError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Cancelled => FileError::Cancelled,
            other => FileError::Client(other),
        }
    }
}

impl From<io::Error> for FileError {
    fn from(e: io::Error) -> Self {
        FileError::Failed(e.to_string())
    }
}

impl From<DatabaseError> for FileError {
    fn from(e: DatabaseError) -> Self {
        FileError::Failed(e.to_string())
    }
}

impl ToErrno for FileError {
    fn to_errno(&self) -> i32 {
        match self {
            FileError::Cancelled => libc::ECANCELED,
            FileError::Failed(_) => libc::EIO,
            FileError::Removed => libc::ENOENT,
            FileError::InvalidArguments(_) => libc::EINVAL,
            FileError::ReadOnly => libc::EROFS,
            FileError::Client(e) => e.to_errno(),
        }
    }
}

/// Result of a file request.
pub type FileResult<T> = Result<T, FileError>;

/// Errors raised by service-level operations.
#[derive(Debug, Error)]
pub enum FileServiceError {
    /// No file with this ID is known.
    #[error("unknown file: {0}")]
    UnknownFile(FileID),

    /// The file has been removed.
    #[error("file has been removed: {0}")]
    Removed(FileID),

    /// Persistence failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Local storage failed.
    #[error("storage error: {0}")]
    Io(#[from] io::Error),

    /// The cloud client reported an error.
    #[error("client error: {0}")]
    Client(#[from] ClientError),
}

impl ToErrno for FileServiceError {
    fn to_errno(&self) -> i32 {
        match self {
            FileServiceError::UnknownFile(_) | FileServiceError::Removed(_) => libc::ENOENT,
            FileServiceError::Database(_) => libc::EIO,
            FileServiceError::Io(e) => e.to_errno(),
            FileServiceError::Client(e) => e.to_errno(),
        }
    }
}

/// Result of a service-level operation.
pub type FileServiceResult<T> = Result<T, FileServiceError>;

/// Errors raised by [`FileRangeTree`](crate::FileRangeTree) precondition checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileRangeError {
    /// The range covers no bytes.
    #[error("range is empty")]
    Empty,

    /// The range intersects a stored range.
    #[error("range overlaps an existing range")]
    Overlaps,
}

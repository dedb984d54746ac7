//! Errors surfaced to the filesystem layer and results of mount operations.
//!
//! [`FuseError`] is what every filesystem-facing call returns; the platform
//! layer turns it into an errno with [`ToErrno`]. Mount control operations
//! report a [`MountResult`] instead, a plain value carrying a description
//! suitable for showing to a user.

use nimbus_core::{ClientError, DatabaseError, ToErrno};
use nimbus_file_service::{FileError, FileServiceError};
use std::fmt;
use std::io;
use thiserror::Error;

/// Errors returned by inode and context operations.
#[derive(Debug, Error)]
pub enum FuseError {
    /// No such entry.
    #[error("no such file or directory")]
    NotFound,

    /// The entry existed but has since been removed.
    #[error("entry has been removed")]
    Removed,

    /// An entry with that name already exists.
    #[error("entry already exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("permission denied")]
    PermissionDenied,

    /// The mount or the entry does not permit modification.
    #[error("read-only")]
    ReadOnly,

    /// The operation was abandoned.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("file error: {0}")]
    File(#[from] FileError),

    #[error("file service error: {0}")]
    FileService(#[from] FileServiceError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ToErrno for FuseError {
    fn to_errno(&self) -> i32 {
        match self {
            FuseError::NotFound | FuseError::Removed => libc::ENOENT,
            FuseError::Exists => libc::EEXIST,
            FuseError::NotDirectory => libc::ENOTDIR,
            FuseError::IsDirectory => libc::EISDIR,
            FuseError::NotEmpty => libc::ENOTEMPTY,
            FuseError::PermissionDenied => libc::EACCES,
            FuseError::ReadOnly => libc::EROFS,
            FuseError::Cancelled => libc::ECANCELED,
            FuseError::InvalidArgument(_) => libc::EINVAL,
            FuseError::Client(e) => e.to_errno(),
            FuseError::File(e) => e.to_errno(),
            FuseError::FileService(e) => e.to_errno(),
            FuseError::Database(e) => e.to_errno(),
            FuseError::Io(e) => e.to_errno(),
        }
    }
}

/// Result type for filesystem-facing operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Outcome of a mount control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountResult {
    Success,
    /// No mount has the given name.
    Unknown,
    /// Something went wrong that the caller could not have prevented.
    Unexpected,
    /// The mount's root node does not exist.
    RemoteUnknown,
    /// The mount has no name.
    NoName,
    /// Another mount already has that name.
    NameTaken,
    /// The mount is in the wrong state for the operation.
    Busy,
    /// The mount's root node is a file.
    RemoteFile,
    /// The local path names a file.
    LocalFile,
    /// The local path is already occupied.
    LocalExists,
    /// The platform cannot provide mounts.
    Unsupported,
    /// The local path does not exist.
    LocalUnknown,
    /// The mount already exists.
    Exists,
    /// Another mount uses the local path.
    LocalTaken,
    /// The local path is under synchronization by another client.
    LocalSyncing,
}

impl MountResult {
    pub fn is_success(self) -> bool {
        self == MountResult::Success
    }

    /// Text suitable for showing to a user.
    pub fn description(self) -> &'static str {
        match self {
            MountResult::Success => "Success",
            MountResult::Unknown => "No such mount",
            MountResult::Unexpected => "An unexpected error occurred",
            MountResult::RemoteUnknown => "The cloud directory does not exist",
            MountResult::NoName => "The mount has no name",
            MountResult::NameTaken => "Another mount already uses this name",
            MountResult::Busy => "The mount is busy",
            MountResult::RemoteFile => "Only directories can be mounted",
            MountResult::LocalFile => "The local path is a file",
            MountResult::LocalExists => "The local path already exists",
            MountResult::Unsupported => "Mounts are not supported on this system",
            MountResult::LocalUnknown => "The local path does not exist",
            MountResult::Exists => "The mount already exists",
            MountResult::LocalTaken => "Another mount already uses this local path",
            MountResult::LocalSyncing => "The local path is being synchronized",
        }
    }
}

impl fmt::Display for MountResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<ClientError> for MountResult {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::NotFound => MountResult::RemoteUnknown,
            ClientError::NotDirectory => MountResult::RemoteFile,
            _ => MountResult::Unexpected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FuseError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(FuseError::Removed.to_errno(), libc::ENOENT);
        assert_eq!(FuseError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(FuseError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(
            FuseError::Client(ClientError::PermissionDenied).to_errno(),
            libc::EACCES
        );
        assert_eq!(FuseError::File(FileError::Removed).to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_mount_result_descriptions() {
        assert!(MountResult::Success.is_success());
        assert!(!MountResult::Busy.is_success());
        assert_eq!(
            MountResult::LocalTaken.to_string(),
            "Another mount already uses this local path"
        );
    }

    #[test]
    fn test_client_errors_map_to_mount_results() {
        assert_eq!(MountResult::from(ClientError::NotFound), MountResult::RemoteUnknown);
        assert_eq!(MountResult::from(ClientError::NotDirectory), MountResult::RemoteFile);
        assert_eq!(MountResult::from(ClientError::Busy), MountResult::Unexpected);
    }
}

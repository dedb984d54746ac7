//! Shared foundations for the nimbus cloud-storage stack.
//!
//! This crate holds what the file service and the FUSE layer both need:
//!
//! - [`ids`]: node handles, inode IDs, mount inode IDs, file IDs, bind handles
//! - [`client`]: the [`Client`] trait through which the remote tree is reached
//! - [`node_event`]: batches of remote changes and their observers
//! - [`completion`]: exactly-once callbacks and cancellation tokens
//! - [`executor`]: the elastic [`TaskExecutor`] worker pool
//! - [`watchdog`]: deadline enforcement for operations that must not hang
//! - [`database`]: SQLite persistence with nested transactions and migrations
//!
//! Enable the `testing` feature for [`testing::MockClient`] and tracing setup
//! helpers.

pub mod client;
pub mod completion;
pub mod database;
pub mod error;
pub mod executor;
pub mod ids;
pub mod node_event;
pub mod path;
pub mod watchdog;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{
    AccessLevel, Client, DownloadCompletion, NodeInfo, ObserverId, PartialDownload,
    UploadCompletion,
};
pub use completion::{CancelToken, Cancelled, Completion};
pub use database::{Database, DatabaseLock, Migration, QueryRow, ScopedQuery, Transaction};
pub use error::{ClientError, DatabaseError, DatabaseResult, ErrorOr, ToErrno};
pub use executor::{ExecutorStats, Task, TaskExecutor, TaskExecutorFlags};
pub use ids::{BindHandle, FileID, InodeID, MountInodeID, NodeHandle};
pub use node_event::{NodeEvent, NodeEventObserver, NodeEventQueue, NodeEventType};
pub use path::NormalizedPath;
pub use watchdog::{AbortHandler, Watchdog, WatchdogGuard};

//! The cloud client collaborator.
//!
//! Everything nimbus knows about the remote tree comes through [`Client`]:
//! node metadata, partial downloads, uploads, structural changes, and the
//! stream of [`NodeEvent`](crate::NodeEvent) batches. The transfer layer
//! behind it is out of scope; implementations only have to honour the
//! completion contract of each method.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::completion::Completion;
use crate::error::ErrorOr;
use crate::ids::{BindHandle, NodeHandle};
use crate::node_event::NodeEventObserver;

/// Access a user has to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessLevel {
    /// Contents may be read but not changed.
    ReadOnly,
    /// Contents may be read and written.
    ReadWrite,
    /// Full control, including removal and sharing.
    Full,
}

impl AccessLevel {
    /// Whether the level permits modification.
    pub fn writable(self) -> bool {
        !matches!(self, AccessLevel::ReadOnly)
    }
}

/// Metadata describing a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// The node.
    pub handle: NodeHandle,
    /// Its parent ([`NodeHandle::UNDEF`] for a root).
    pub parent: NodeHandle,
    /// Its name.
    pub name: String,
    /// Whether it is a directory.
    pub is_directory: bool,
    /// Content size in bytes (zero for directories).
    pub size: u64,
    /// Modification time in seconds since the epoch.
    pub modified: i64,
    /// The user's access level.
    pub permissions: AccessLevel,
}

/// Receives the bytes of a partial download.
pub type DownloadCompletion = Completion<Vec<u8>>;

/// Receives the handle of an uploaded node.
pub type UploadCompletion = Completion<NodeHandle>;

/// A download in flight.
pub trait PartialDownload: Send + Sync {
    /// Requests cancellation. The download's completion still fires once,
    /// with [`ClientError::Cancelled`](crate::ClientError::Cancelled) unless
    /// it had already finished.
    fn cancel(&self);

    /// Whether cancellation has been requested.
    fn cancelled(&self) -> bool;
}

/// Identifies a registered event observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Handle-addressed access to the remote tree.
pub trait Client: Send + Sync {
    /// Metadata for `handle`.
    fn get(&self, handle: NodeHandle) -> ErrorOr<NodeInfo>;

    /// The child of `parent` called `name`.
    fn lookup(&self, parent: NodeHandle, name: &str) -> ErrorOr<NodeInfo>;

    /// All children of `parent`.
    fn children(&self, parent: NodeHandle) -> ErrorOr<Vec<NodeInfo>>;

    /// Whether `handle` names an existing node.
    fn exists(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// The user's access level for `handle`.
    fn permissions(&self, handle: NodeHandle) -> ErrorOr<AccessLevel> {
        self.get(handle).map(|info| info.permissions)
    }

    /// Whether `handle` may be used as the root of a mount.
    fn mountable(&self, handle: NodeHandle) -> ErrorOr<bool> {
        self.get(handle).map(|info| info.is_directory)
    }

    /// Starts downloading `length` bytes of `handle` beginning at `offset`.
    ///
    /// Failures to start are reported through the completion as well. The
    /// completion fires exactly once, possibly on another thread and possibly
    /// before this method returns. Fewer than `length` bytes are delivered
    /// when the node is shorter.
    fn download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
        completion: DownloadCompletion,
    ) -> Arc<dyn PartialDownload>;

    /// Uploads `content` as `name` under `parent`.
    ///
    /// Uploading over an existing file stores a new version under the same
    /// handle and emits `Modified`; otherwise a node is created and `Added`
    /// is emitted. Either event echoes `bind_handle` so that observers can
    /// associate the node with local state.
    fn upload(
        &self,
        content: Vec<u8>,
        parent: NodeHandle,
        name: &str,
        bind_handle: &BindHandle,
        completion: UploadCompletion,
    );

    /// Creates a directory.
    fn make_directory(&self, parent: NodeHandle, name: &str) -> ErrorOr<NodeInfo>;

    /// Moves `handle` under `new_parent` as `new_name`.
    fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle, new_name: &str) -> ErrorOr<()>;

    /// Renames `handle` in place.
    fn rename(&self, handle: NodeHandle, new_name: &str) -> ErrorOr<()>;

    /// Removes `handle` (and, for directories, everything below it).
    fn remove(&self, handle: NodeHandle) -> ErrorOr<()>;

    /// Replaces `target`'s content with `source`'s, removing `source`.
    fn replace(&self, source: NodeHandle, target: NodeHandle) -> ErrorOr<()>;

    /// Sets the modification time of `handle`.
    fn touch(&self, handle: NodeHandle, modified: i64) -> ErrorOr<()>;

    /// Registers an observer for node event batches.
    fn add_event_observer(&self, observer: Weak<dyn NodeEventObserver>) -> ObserverId;

    /// Unregisters an observer.
    fn remove_event_observer(&self, id: ObserverId);
}

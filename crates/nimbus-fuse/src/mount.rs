//! One association between a local path and a remote directory.
//!
//! A [`Mount`] exists while its mount is enabled. The platform layer
//! translates kernel requests into calls on it: inode numbers arrive as
//! [`MountInodeID`]s, are mapped onto the shared [`InodeDB`](crate::InodeDB)
//! and come back as [`Attributes`] or contexts. Every context holds an
//! [`ActivityGuard`] so disabling a mount can wait for them to close.

use event_listener::{Event, Listener};
use nimbus_core::{InodeID, MountInodeID, NodeHandle, NormalizedPath};
use nimbus_file_service::FileServiceError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

use crate::config::MountFlags;
use crate::context::{Attributes, DirectoryContext, FileHandleContext};
use crate::error::{FuseError, FuseResult, MountResult};
use crate::inode::InodeRef;
use crate::service::ServiceContext;

/// Persisted description of a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub flags: MountFlags,
    /// The remote directory exposed by the mount.
    pub handle: NodeHandle,
    /// Where the mount appears locally.
    pub path: NormalizedPath,
}

impl MountInfo {
    pub fn new(flags: MountFlags, handle: NodeHandle, path: impl Into<NormalizedPath>) -> Self {
        Self {
            flags,
            handle,
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.flags.name
    }
}

/// Lifecycle of a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
    Removed,
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MountState::Disabled => "disabled",
            MountState::Enabling => "enabling",
            MountState::Enabled => "enabled",
            MountState::Disabling => "disabling",
            MountState::Removed => "removed",
        };
        f.write_str(state)
    }
}

/// Registers mounts with the operating system.
///
/// Implemented once per platform. The mount database calls [`check`] before
/// accepting a path and [`mount`] when a mount is enabled.
///
/// [`check`]: MountPlatform::check
/// [`mount`]: MountPlatform::mount
pub trait MountPlatform: Send + Sync {
    /// Whether `path` can host a mount.
    fn check(&self, path: &NormalizedPath) -> MountResult {
        let _ = path;
        MountResult::Success
    }

    /// Registers `mount` with the operating system.
    ///
    /// The returned session is run on a thread of its own until stopped.
    ///
    /// # Errors
    ///
    /// Returns the reason the mount could not be registered.
    fn mount(&self, mount: Arc<Mount>) -> Result<Arc<dyn MountSession>, MountResult>;
}

/// A mount registered with the operating system.
pub trait MountSession: Send + Sync {
    /// Serves requests until [`stop`](MountSession::stop) is called.
    fn run(&self);

    /// Makes [`run`](MountSession::run) return.
    fn stop(&self);
}

/// Counts the contexts open on a mount.
#[derive(Default)]
struct Activity {
    count: AtomicUsize,
    idle: Event,
}

/// Keeps a mount busy while held.
#[must_use = "the mount is only busy while the guard is held"]
pub struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        if self.activity.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.activity.idle.notify(usize::MAX);
        }
    }
}

impl fmt::Debug for ActivityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityGuard")
            .field("active", &self.activity.count.load(Ordering::Acquire))
            .finish()
    }
}

/// An enabled mount.
pub struct Mount {
    info: RwLock<MountInfo>,
    root: InodeRef,
    activity: Arc<Activity>,
    pub(crate) context: Arc<ServiceContext>,
}

impl Mount {
    pub(crate) fn new(info: MountInfo, context: Arc<ServiceContext>) -> FuseResult<Arc<Self>> {
        let root = context.inode_db.root(info.handle)?;
        Ok(Arc::new(Self {
            info: RwLock::new(info),
            root,
            activity: Arc::new(Activity::default()),
            context,
        }))
    }

    pub fn info(&self) -> MountInfo {
        self.info.read().clone()
    }

    pub(crate) fn set_info(&self, info: MountInfo) {
        *self.info.write() = info;
    }

    pub fn name(&self) -> String {
        self.info.read().flags.name.clone()
    }

    pub fn path(&self) -> NormalizedPath {
        self.info.read().path.clone()
    }

    pub fn read_only(&self) -> bool {
        self.info.read().flags.read_only
    }

    /// Number of contexts currently open on the mount.
    pub fn activity(&self) -> usize {
        self.activity.count.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) -> ActivityGuard {
        self.activity.count.fetch_add(1, Ordering::AcqRel);
        ActivityGuard {
            activity: Arc::clone(&self.activity),
        }
    }

    /// Blocks until every context of the mount has closed.
    pub(crate) fn wait_idle(&self) {
        loop {
            if self.activity() == 0 {
                return;
            }
            let listener = self.activity.idle.listen();
            if self.activity() == 0 {
                return;
            }
            debug!(active = self.activity(), "Waiting for mount contexts to close");
            listener.wait();
        }
    }

    pub(crate) fn inode_id(&self, id: MountInodeID) -> InodeID {
        id.unmap(self.root.id())
    }

    pub(crate) fn mount_id(&self, id: InodeID) -> MountInodeID {
        MountInodeID::map(id, self.root.id())
    }

    pub(crate) fn inode(&self, id: MountInodeID) -> FuseResult<InodeRef> {
        if id == MountInodeID::ROOT {
            if self.root.removed() {
                return Err(FuseError::NotFound);
            }
            return Ok(self.root.clone());
        }
        self.context.inode_db.get(self.inode_id(id))
    }

    /// Attributes of the entry `id`.
    pub fn attributes(&self, id: MountInodeID) -> FuseResult<Attributes> {
        let inode = self.inode(id)?;
        Ok(self.attributes_of(&inode))
    }

    pub(crate) fn attributes_of(&self, inode: &InodeRef) -> Attributes {
        let info = inode.info();
        let mut attributes = Attributes {
            id: self.mount_id(info.id),
            is_directory: info.is_directory,
            size: info.size,
            modified: info.modified,
            permissions: info.permissions,
            read_only: self.read_only() || !info.permissions.writable(),
        };
        // Local content is authoritative once the file service knows the file.
        if let Some(file_id) = inode.file().and_then(|file| file.file_id())
            && let Ok(file) = self.context.file_service.info(file_id)
            && !file.removed
        {
            attributes.size = file.size;
            attributes.modified = file.modified;
        }
        attributes
    }

    /// Attributes of the child of `parent` called `name`.
    pub fn lookup(&self, parent: MountInodeID, name: &str) -> FuseResult<Attributes> {
        let parent = self.inode(parent)?;
        let inode = self.context.inode_db.lookup(&parent, name)?;
        Ok(self.attributes_of(&inode))
    }

    /// Opens the directory `id`.
    pub fn directory(self: &Arc<Self>, id: MountInodeID) -> FuseResult<DirectoryContext> {
        let inode = self.inode(id)?;
        if !inode.is_directory() {
            return Err(FuseError::NotDirectory);
        }
        trace!(mount = %self.name(), %id, "Directory opened");
        Ok(DirectoryContext::new(Arc::clone(self), inode))
    }

    /// Opens the file `id`.
    pub fn open(self: &Arc<Self>, id: MountInodeID) -> FuseResult<FileHandleContext> {
        let inode = self.inode(id)?;
        let file_inode = inode.file().ok_or(FuseError::IsDirectory)?;
        let service = &self.context.file_service;

        let current = match file_inode.file_id() {
            Some(file_id) => match service.open(file_id) {
                Ok(file) if !file.info().removed => Some(file),
                // Replaced by a remote change since it was last opened.
                Ok(_) | Err(FileServiceError::Removed(_) | FileServiceError::UnknownFile(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => None,
        };
        let file = match current {
            Some(file) => file,
            None if inode.is_bound() => service.open(service.add(inode.handle())?)?,
            None => return Err(FuseError::Removed),
        };
        file_inode.set_file_id(file.id());

        trace!(mount = %self.name(), %id, file = %file.id(), "File opened");
        Ok(FileHandleContext::new(Arc::clone(self), inode, file))
    }
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("info", &*self.info.read())
            .field("root", &self.root.id())
            .field("activity", &self.activity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mount_info_name() {
        let info = MountInfo::new(MountFlags::new("docs"), NodeHandle::new(3), "/mnt/docs/");
        assert_eq!(info.name(), "docs");
        assert_eq!(info.path, NormalizedPath::new("/mnt/docs"));
    }

    #[test]
    fn test_activity_guards_count_and_notify() {
        let activity = Arc::new(Activity::default());
        let enter = || {
            activity.count.fetch_add(1, Ordering::AcqRel);
            ActivityGuard {
                activity: Arc::clone(&activity),
            }
        };
        let first = enter();
        let second = enter();
        assert_eq!(activity.count.load(Ordering::Acquire), 2);

        let listener = activity.idle.listen();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(first);
            drop(second);
        });
        listener.wait();
        releaser.join().unwrap();
        assert_eq!(activity.count.load(Ordering::Acquire), 0);
    }
}

//! In-memory filesystem entities.
//!
//! An [`Inode`] is owned by the [`InodeDB`]; everything else holds it
//! through a [`Ref`]. Identity fields only change through methods that take
//! a [`Badge<InodeDB>`], so binding, moving and removal stay consistent
//! with the registry's indexes.

use nimbus_core::{AccessLevel, BindHandle, FileID, InodeID, NodeHandle, NodeInfo};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::inode_db::InodeDB;
use crate::reference::{Badge, Ref, Referenced};

/// A counted reference to an inode.
pub type InodeRef = Ref<Inode>;

/// Attributes of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeInfo {
    pub id: InodeID,
    /// The remote node, or [`NodeHandle::UNDEF`] until a new file is uploaded.
    pub handle: NodeHandle,
    /// `None` for a mount root.
    pub parent: Option<InodeID>,
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    /// Seconds since the epoch.
    pub modified: i64,
    pub permissions: AccessLevel,
}

impl InodeInfo {
    /// Attributes of a remote node.
    pub fn from_node(node: &NodeInfo, parent: Option<InodeID>) -> Self {
        Self {
            id: InodeID::from_handle(node.handle),
            handle: node.handle,
            parent,
            name: node.name.clone(),
            is_directory: node.is_directory,
            size: node.size,
            modified: node.modified,
            permissions: node.permissions,
        }
    }
}

/// Directory state: the children currently in memory, by name.
#[derive(Debug, Default)]
pub struct DirectoryInode {
    children: Mutex<HashMap<String, InodeID>>,
}

impl DirectoryInode {
    /// The in-memory child called `name`.
    pub fn child(&self, name: &str) -> Option<InodeID> {
        self.children.lock().get(name).copied()
    }

    /// Number of children in memory.
    pub fn materialized(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn children(&self) -> Vec<(String, InodeID)> {
        self.children
            .lock()
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    pub(crate) fn link(&self, name: &str, id: InodeID) -> Option<InodeID> {
        self.children.lock().insert(name.to_string(), id)
    }

    /// Removes `name` if it still names `id`.
    pub(crate) fn unlink(&self, name: &str, id: InodeID) -> bool {
        let mut children = self.children.lock();
        if children.get(name) == Some(&id) {
            children.remove(name);
            return true;
        }
        false
    }
}

/// File state: how the file is known to the file service.
#[derive(Debug, Default)]
pub struct FileInode {
    bind_handle: Mutex<BindHandle>,
    file: Mutex<Option<FileID>>,
}

impl FileInode {
    pub(crate) fn new(bind_handle: BindHandle) -> Self {
        Self {
            bind_handle: Mutex::new(bind_handle),
            file: Mutex::new(None),
        }
    }

    /// Key echoed by the node event that creates this file remotely.
    /// Empty once the file is bound.
    pub fn bind_handle(&self) -> BindHandle {
        self.bind_handle.lock().clone()
    }

    /// The file service's identifier for this file, once opened.
    pub fn file_id(&self) -> Option<FileID> {
        *self.file.lock()
    }

    pub(crate) fn set_file_id(&self, id: FileID) {
        *self.file.lock() = Some(id);
    }

    pub(crate) fn clear_bind_handle(&self) -> BindHandle {
        std::mem::take(&mut *self.bind_handle.lock())
    }
}

/// What kind of entity an inode is.
#[derive(Debug)]
pub enum InodeKind {
    Directory(DirectoryInode),
    File(FileInode),
}

/// A file or directory in memory.
pub struct Inode {
    info: RwLock<InodeInfo>,
    kind: InodeKind,
    parent: Mutex<Option<InodeRef>>,
    references: AtomicU64,
    removed: AtomicBool,
    db: Weak<InodeDB>,
}

impl Inode {
    pub(crate) fn new(
        _: Badge<InodeDB>,
        info: InodeInfo,
        kind: InodeKind,
        parent: Option<InodeRef>,
        db: Weak<InodeDB>,
    ) -> Arc<Self> {
        Arc::new(Self {
            info: RwLock::new(info),
            kind,
            parent: Mutex::new(parent),
            references: AtomicU64::new(0),
            removed: AtomicBool::new(false),
            db,
        })
    }

    pub fn id(&self) -> InodeID {
        self.info.read().id
    }

    pub fn handle(&self) -> NodeHandle {
        self.info.read().handle
    }

    pub fn name(&self) -> String {
        self.info.read().name.clone()
    }

    /// A copy of the inode's attributes.
    pub fn info(&self) -> InodeInfo {
        self.info.read().clone()
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub fn directory(&self) -> Option<&DirectoryInode> {
        match &self.kind {
            InodeKind::Directory(directory) => Some(directory),
            InodeKind::File(_) => None,
        }
    }

    pub fn file(&self) -> Option<&FileInode> {
        match &self.kind {
            InodeKind::File(file) => Some(file),
            InodeKind::Directory(_) => None,
        }
    }

    /// Whether the inode names a remote node yet.
    pub fn is_bound(&self) -> bool {
        !self.handle().is_undef()
    }

    /// Whether the inode has been removed. Removed inodes stay in memory
    /// until their last reference is released.
    pub fn removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Number of outstanding references.
    pub fn references(&self) -> u64 {
        self.references.load(Ordering::Acquire)
    }

    /// The containing directory.
    pub fn parent(&self) -> Option<InodeRef> {
        self.parent.lock().clone()
    }

    pub(crate) fn update(&self, _: Badge<InodeDB>, update: impl FnOnce(&mut InodeInfo)) {
        update(&mut self.info.write());
    }

    /// Returns the previous parent so the caller can release it once it
    /// holds no locks.
    pub(crate) fn set_parent(&self, _: Badge<InodeDB>, parent: Option<InodeRef>) -> Option<InodeRef> {
        std::mem::replace(&mut *self.parent.lock(), parent)
    }

    /// Returns whether the inode was live until now.
    pub(crate) fn mark_removed(&self, _: Badge<InodeDB>) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }
}

impl Referenced for Inode {
    fn do_ref(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    fn do_unref(&self) {
        if self.references.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(db) = self.db.upgrade()
        {
            db.released(self);
        }
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info.read();
        f.debug_struct("Inode")
            .field("id", &info.id)
            .field("handle", &info.handle)
            .field("name", &info.name)
            .field("is_directory", &info.is_directory)
            .field("references", &self.references())
            .field("removed", &self.removed())
            .finish_non_exhaustive()
    }
}

//! Contexts handed to the platform layer for open directories and files.
//!
//! The file service reports through completions; these contexts block on
//! them so the platform's request threads see plain results mapped to
//! [`FuseError`].

use bytes::Bytes;
use nimbus_core::{AccessLevel, BindHandle, Completion, MountInodeID, NodeHandle};
use nimbus_file_service::{FileContext, FileError, FileLocation, FileRange};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::error::{FuseError, FuseResult};
use crate::inode::InodeRef;
use crate::inode_db::InodeDB;
use crate::mount::{ActivityGuard, Mount};

/// What the platform layer reports for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub id: MountInodeID,
    pub is_directory: bool,
    pub size: u64,
    /// Seconds since the epoch.
    pub modified: i64,
    pub permissions: AccessLevel,
    /// Whether modifications are refused, by the mount or by permissions.
    pub read_only: bool,
}

/// Runs `start` and blocks until its completion fires.
fn wait<T: Send + 'static>(start: impl FnOnce(Completion<T, FileError>)) -> FuseResult<T> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    start(Completion::new(move |result| {
        let _ = tx.send(result);
    }));
    match rx.recv() {
        Ok(result) => result.map_err(file_error),
        Err(_) => Err(FuseError::Cancelled),
    }
}

fn file_error(e: FileError) -> FuseError {
    match e {
        FileError::Cancelled => FuseError::Cancelled,
        FileError::ReadOnly => FuseError::ReadOnly,
        FileError::Removed => FuseError::Removed,
        other => FuseError::File(other),
    }
}

fn bind_handle_of(inode: &InodeRef) -> BindHandle {
    inode
        .file()
        .map(|file| file.bind_handle())
        .unwrap_or_default()
}

fn bind_flushed(inode_db: &InodeDB, inode: &InodeRef, handle: NodeHandle) -> FuseResult<()> {
    if !inode.is_bound() {
        inode_db.bind(inode, handle)?;
    }
    Ok(())
}

/// Uploads `file` if it has local changes, binding `inode` to the result.
fn flush(inode_db: &InodeDB, inode: &InodeRef, file: &Arc<FileContext>) -> FuseResult<()> {
    let bind_handle = bind_handle_of(inode);
    let handle = wait(|completion| file.flush(bind_handle, completion))?;
    bind_flushed(inode_db, inode, handle)
}

/// An open directory.
#[derive(Debug)]
pub struct DirectoryContext {
    mount: Arc<Mount>,
    inode: InodeRef,
    _activity: ActivityGuard,
}

impl DirectoryContext {
    pub(crate) fn new(mount: Arc<Mount>, inode: InodeRef) -> Self {
        let activity = mount.enter();
        Self {
            mount,
            inode,
            _activity: activity,
        }
    }

    pub fn id(&self) -> MountInodeID {
        self.mount.mount_id(self.inode.id())
    }

    pub fn attributes(&self) -> Attributes {
        self.mount.attributes_of(&self.inode)
    }

    /// Every entry of the directory, sorted by name.
    pub fn entries(&self) -> FuseResult<Vec<(String, Attributes)>> {
        let children = self.mount.context.inode_db.children(&self.inode)?;
        Ok(children
            .iter()
            .map(|child| (child.name(), self.mount.attributes_of(child)))
            .collect())
    }

    pub fn lookup(&self, name: &str) -> FuseResult<Attributes> {
        let inode = self.mount.context.inode_db.lookup(&self.inode, name)?;
        Ok(self.mount.attributes_of(&inode))
    }

    fn ensure_writable(&self) -> FuseResult<()> {
        if self.mount.read_only() {
            return Err(FuseError::ReadOnly);
        }
        if !self.inode.info().permissions.writable() {
            return Err(FuseError::PermissionDenied);
        }
        Ok(())
    }

    #[instrument(level = "debug", name = "directory::make_directory", skip(self), fields(mount = %self.mount.name()))]
    pub fn make_directory(&self, name: &str) -> FuseResult<Attributes> {
        self.ensure_writable()?;
        let inode = self.mount.context.inode_db.make_directory(&self.inode, name)?;
        Ok(self.mount.attributes_of(&inode))
    }

    /// Creates an empty file and opens it. The file is uploaded once flushed.
    #[instrument(level = "debug", name = "directory::create_file", skip(self), fields(mount = %self.mount.name()))]
    pub fn create_file(&self, name: &str) -> FuseResult<FileHandleContext> {
        self.ensure_writable()?;
        let inode_db = &self.mount.context.inode_db;
        let inode = inode_db.create_file(&self.inode, name)?;

        let file = match self.mount.context.file_service.create(self.inode.handle(), name) {
            Ok(file) => file,
            Err(e) => {
                let _ = inode_db.remove(&inode);
                return Err(e.into());
            }
        };
        if let Some(file_inode) = inode.file() {
            file_inode.set_file_id(file.id());
        }
        Ok(FileHandleContext::new(Arc::clone(&self.mount), inode, file))
    }

    /// Removes the entry `name`, locally and remotely.
    #[instrument(level = "debug", name = "directory::remove", skip(self), fields(mount = %self.mount.name()))]
    pub fn remove(&self, name: &str) -> FuseResult<()> {
        self.ensure_writable()?;
        let context = &self.mount.context;
        let inode = context.inode_db.lookup(&self.inode, name)?;

        if let Some(file_id) = inode.file().and_then(|file| file.file_id()) {
            match context.file_service.open(file_id) {
                Ok(file) => wait(|completion| file.remove(completion))?,
                Err(e) => debug!(%file_id, error = %e, "File already gone from the file service"),
            }
        }
        match context.inode_db.remove(&inode) {
            // The remote removal's node event may already have been applied.
            Err(FuseError::NotFound) if inode.removed() => Ok(()),
            result => result,
        }
    }

    /// Moves the entry `name` into `new_parent` as `new_name`.
    #[instrument(level = "debug", name = "directory::rename", skip(self), fields(mount = %self.mount.name()))]
    pub fn rename(&self, name: &str, new_parent: MountInodeID, new_name: &str) -> FuseResult<()> {
        self.ensure_writable()?;
        let context = &self.mount.context;
        let inode = context.inode_db.lookup(&self.inode, name)?;
        let target = self.mount.inode(new_parent)?;
        context.inode_db.move_inode(&inode, &target, new_name)?;

        // An unbound file is uploaded wherever it lives when flushed.
        if !inode.is_bound()
            && let Some(file_id) = inode.file().and_then(|file| file.file_id())
        {
            context
                .file_service
                .relocate(file_id, FileLocation::new(target.handle(), new_name))?;
        }
        Ok(())
    }
}

/// An open file.
pub struct FileHandleContext {
    mount: Arc<Mount>,
    inode: InodeRef,
    file: Arc<FileContext>,
    _activity: ActivityGuard,
}

impl FileHandleContext {
    pub(crate) fn new(mount: Arc<Mount>, inode: InodeRef, file: Arc<FileContext>) -> Self {
        let activity = mount.enter();
        Self {
            mount,
            inode,
            file,
            _activity: activity,
        }
    }

    pub fn id(&self) -> MountInodeID {
        self.mount.mount_id(self.inode.id())
    }

    pub fn attributes(&self) -> Attributes {
        self.mount.attributes_of(&self.inode)
    }

    /// The file service's view of the file.
    pub fn file(&self) -> &Arc<FileContext> {
        &self.file
    }

    fn ensure_writable(&self) -> FuseResult<()> {
        if self.mount.read_only() || self.file.read_only() {
            return Err(FuseError::ReadOnly);
        }
        Ok(())
    }

    /// Reads up to `length` bytes at `offset`. Reads past the end of the
    /// file return fewer bytes.
    pub fn read(&self, offset: u64, length: u64) -> FuseResult<Bytes> {
        let size = self.file.info().size;
        if offset >= size || length == 0 {
            return Ok(Bytes::new());
        }
        let range = FileRange::with_length(offset, length.min(size - offset));
        let file = &self.file;
        wait(|completion| file.read(range, completion))
    }

    /// Writes `data` at `offset`, returning the number of bytes written.
    pub fn write(&self, offset: u64, data: &[u8]) -> FuseResult<usize> {
        self.ensure_writable()?;
        let length = data.len();
        let data = Bytes::copy_from_slice(data);
        let file = &self.file;
        wait(|completion| file.write(offset, data, completion))?;
        Ok(length)
    }

    pub fn truncate(&self, size: u64) -> FuseResult<()> {
        self.ensure_writable()?;
        let file = &self.file;
        wait(|completion| file.truncate(size, completion))
    }

    /// Sets the modification time, in seconds since the epoch.
    pub fn touch(&self, modified: i64) -> FuseResult<()> {
        self.ensure_writable()?;
        let file = &self.file;
        wait(|completion| file.touch(modified, completion))
    }

    /// Uploads local changes now.
    pub fn flush(&self) -> FuseResult<()> {
        if self.mount.read_only() || !self.file.info().dirty {
            return Ok(());
        }
        flush(&self.mount.context.inode_db, &self.inode, &self.file)
    }
}

impl Drop for FileHandleContext {
    fn drop(&mut self) {
        if self.mount.read_only() || self.inode.removed() || !self.file.info().dirty {
            return;
        }

        let context = &self.mount.context;
        let delay = context.flags.read().flush_delay;
        let inode_db = Arc::clone(&context.inode_db);
        let inode = self.inode.clone();
        let file = Arc::clone(&self.file);
        debug!(id = %inode.id(), delay_ms = delay.as_millis(), "Scheduling flush");

        // Runs on a worker, so it must not wait for the upload.
        context.executor.execute_after(
            move |task| {
                if task.cancelled() || inode.removed() || !file.info().dirty {
                    return;
                }
                let bind_handle = bind_handle_of(&inode);
                file.flush(
                    bind_handle,
                    Completion::new(move |result: Result<NodeHandle, FileError>| {
                        let result = result
                            .map_err(file_error)
                            .and_then(|handle| bind_flushed(&inode_db, &inode, handle));
                        if let Err(e) = result {
                            warn!(id = %inode.id(), error = %e, "Delayed flush failed");
                        }
                    }),
                );
            },
            delay,
        );
    }
}

impl std::fmt::Debug for FileHandleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandleContext")
            .field("inode", &self.inode.id())
            .field("file", &self.file.id())
            .finish_non_exhaustive()
    }
}

//! Shared, observable attributes of a cached file.

use dashmap::DashMap;
use nimbus_core::{FileID, NodeHandle};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::event::{FileEvent, FileEventEmitter, FileEventObserver, FileEventObserverID};
use crate::range::FileRange;

/// Where a file lives in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileLocation {
    pub parent: NodeHandle,
    pub name: String,
}

impl FileLocation {
    pub fn new(parent: NodeHandle, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
        }
    }
}

/// Snapshot of a file's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: FileID,
    /// [`NodeHandle::UNDEF`] until the file has been uploaded.
    pub handle: NodeHandle,
    pub location: FileLocation,
    pub size: u64,
    /// Seconds since the epoch.
    pub modified: i64,
    /// Seconds since the epoch.
    pub accessed: i64,
    /// Bytes held in local storage.
    pub allocated_size: u64,
    /// Size reported by the cloud when the file was added.
    pub reported_size: u64,
    /// Whether the file has local modifications not yet flushed.
    pub dirty: bool,
    pub removed: bool,
}

pub(crate) type InfoIndex = DashMap<FileID, Weak<FileInfoContext>>;

/// Seconds since the epoch.
pub(crate) fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}

/// Attributes of one file, shared by every open context of that file.
///
/// Mutators notify the file's own observers first, then the service's.
pub struct FileInfoContext {
    info: RwLock<FileInfo>,
    emitter: FileEventEmitter,
    service: Arc<FileEventEmitter>,
    index: Weak<InfoIndex>,
}

impl FileInfoContext {
    pub(crate) fn new(info: FileInfo, service: Arc<FileEventEmitter>, index: &Arc<InfoIndex>) -> Arc<Self> {
        let id = info.id;
        let context = Arc::new(Self {
            info: RwLock::new(info),
            emitter: FileEventEmitter::new(),
            service,
            index: Arc::downgrade(index),
        });
        index.insert(id, Arc::downgrade(&context));
        context
    }

    fn notify(&self, event: &FileEvent) {
        self.emitter.notify(event);
        self.service.notify(event);
    }

    pub fn id(&self) -> FileID {
        self.info.read().id
    }

    pub fn handle(&self) -> NodeHandle {
        self.info.read().handle
    }

    pub fn location(&self) -> FileLocation {
        self.info.read().location.clone()
    }

    pub fn set_location(&self, location: FileLocation) {
        self.info.write().location = location;
    }

    pub fn size(&self) -> u64 {
        self.info.read().size
    }

    pub fn modified_time(&self) -> i64 {
        self.info.read().modified
    }

    pub fn accessed_time(&self) -> i64 {
        self.info.read().accessed
    }

    pub fn allocated_size(&self) -> u64 {
        self.info.read().allocated_size
    }

    pub fn set_allocated_size(&self, allocated_size: u64) {
        self.info.write().allocated_size = allocated_size;
    }

    pub fn reported_size(&self) -> u64 {
        self.info.read().reported_size
    }

    pub fn dirty(&self) -> bool {
        self.info.read().dirty
    }

    pub fn is_removed(&self) -> bool {
        self.info.read().removed
    }

    /// A copy of every attribute.
    pub fn snapshot(&self) -> FileInfo {
        self.info.read().clone()
    }

    /// Records an access. Access times never move backwards.
    pub fn accessed(&self, accessed: i64) {
        let mut info = self.info.write();
        info.accessed = info.accessed.max(accessed);
    }

    /// Records a successful upload. `modified` is the time the remote
    /// node reports, so that the echoed node event matches.
    pub fn flushed(&self, handle: NodeHandle, modified: i64) {
        debug_assert!(!handle.is_undef());
        let event = {
            let mut info = self.info.write();
            info.handle = handle;
            info.dirty = false;
            info.modified = modified;
            info.reported_size = info.size;
            FileEvent::Flush { id: info.id, handle }
        };
        self.notify(&event);
    }

    /// Records a new modification time.
    pub fn modified(&self, accessed: i64, modified: i64) {
        let event = {
            let mut info = self.info.write();
            info.dirty = true;
            info.accessed = info.accessed.max(accessed);
            info.modified = modified;
            FileEvent::Touch { id: info.id, modified }
        };
        self.notify(&event);
    }

    /// Marks the file removed.
    pub fn removed(&self, replaced: bool) {
        let event = {
            let mut info = self.info.write();
            info.removed = true;
            FileEvent::Remove { id: info.id, replaced }
        };
        self.notify(&event);
    }

    /// Records a size change.
    pub fn truncated(&self, modified: i64, size: u64) {
        let event = {
            let mut info = self.info.write();
            info.dirty = true;
            info.accessed = info.accessed.max(modified);
            info.modified = modified;
            let old = std::mem::replace(&mut info.size, size);
            FileEvent::Truncate {
                id: info.id,
                range: (size < old).then(|| FileRange::new(size, old)),
                size,
            }
        };
        self.notify(&event);
    }

    /// Records a write of `range`.
    pub fn written(&self, modified: i64, range: FileRange) {
        let event = {
            let mut info = self.info.write();
            info.dirty = true;
            info.accessed = info.accessed.max(modified);
            info.modified = modified;
            info.size = info.size.max(range.end());
            FileEvent::Write { id: info.id, range }
        };
        self.notify(&event);
    }

    /// Observes events for this file only.
    pub fn add_observer(&self, observer: FileEventObserver) -> FileEventObserverID {
        self.emitter.add_observer(observer)
    }

    pub fn remove_observer(&self, id: FileEventObserverID) -> bool {
        self.emitter.remove_observer(id)
    }
}

impl Drop for FileInfoContext {
    fn drop(&mut self) {
        let id = self.info.get_mut().id;
        if let Some(index) = self.index.upgrade() {
            index.remove_if(&id, |_, weak| weak.strong_count() == 0);
        }
    }
}

impl std::fmt::Debug for FileInfoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInfoContext")
            .field("info", &*self.info.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn info(id: u64) -> FileInfo {
        FileInfo {
            id: FileID::from_raw(id),
            handle: NodeHandle::UNDEF,
            location: FileLocation::new(NodeHandle::new(1), "a"),
            size: 100,
            modified: 10,
            accessed: 10,
            allocated_size: 0,
            reported_size: 100,
            dirty: false,
            removed: false,
        }
    }

    fn recorder(emitter: &FileEventEmitter, tag: &'static str, log: &Arc<Mutex<Vec<(&'static str, FileEvent)>>>) {
        let log = Arc::clone(log);
        emitter.add_observer(Arc::new(move |event: &FileEvent| log.lock().push((tag, event.clone()))));
    }

    #[test]
    fn test_file_observers_precede_service_observers() {
        let service = Arc::new(FileEventEmitter::new());
        let index = Arc::new(InfoIndex::new());
        let context = FileInfoContext::new(info(1), Arc::clone(&service), &index);
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&service, "service", &log);
        recorder(&context.emitter, "file", &log);

        context.truncated(20, 40);

        let log = log.lock();
        let tags: Vec<_> = log.iter().map(|(tag, _)| *tag).collect();
        assert_eq!(tags, vec!["file", "service"]);
        assert_eq!(
            log[0].1,
            FileEvent::Truncate {
                id: FileID::from_raw(1),
                range: Some(FileRange::new(40, 100)),
                size: 40
            }
        );
        assert!(context.dirty());
        assert_eq!(context.size(), 40);
    }

    #[test]
    fn test_written_grows_size_and_flush_cleans() {
        let service = Arc::new(FileEventEmitter::new());
        let index = Arc::new(InfoIndex::new());
        let context = FileInfoContext::new(info(2), service, &index);

        context.written(30, FileRange::new(90, 150));
        assert_eq!(context.size(), 150);
        assert_eq!(context.modified_time(), 30);
        assert!(context.dirty());

        context.flushed(NodeHandle::new(77), 1234);
        assert!(!context.dirty());
        assert_eq!(context.handle(), NodeHandle::new(77));
        assert_eq!(context.reported_size(), 150);
    }

    #[test]
    fn test_access_time_is_monotonic() {
        let index = Arc::new(InfoIndex::new());
        let context = FileInfoContext::new(info(3), Arc::new(FileEventEmitter::new()), &index);
        context.accessed(50);
        context.accessed(40);
        assert_eq!(context.accessed_time(), 50);
    }

    #[test]
    fn test_drop_removes_index_entry() {
        let index = Arc::new(InfoIndex::new());
        let context = FileInfoContext::new(info(4), Arc::new(FileEventEmitter::new()), &index);
        assert!(index.contains_key(&FileID::from_raw(4)));
        drop(context);
        assert!(!index.contains_key(&FileID::from_raw(4)));
    }
}

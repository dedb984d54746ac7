//! Notifications about changes to a file's attributes and content.

use dashmap::DashMap;
use nimbus_core::{FileID, NodeHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::range::FileRange;

/// A change to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// Local changes were uploaded; the file is now bound to `handle`.
    Flush { id: FileID, handle: NodeHandle },
    /// The file was removed, or its node replaced by another.
    Remove { id: FileID, replaced: bool },
    /// The modification time changed.
    Touch { id: FileID, modified: i64 },
    /// The size changed. `range` holds the bytes cut off when the file shrank.
    Truncate {
        id: FileID,
        range: Option<FileRange>,
        size: u64,
    },
    /// Bytes were written.
    Write { id: FileID, range: FileRange },
}

impl FileEvent {
    /// The file the event concerns.
    pub fn id(&self) -> FileID {
        match self {
            FileEvent::Flush { id, .. }
            | FileEvent::Remove { id, .. }
            | FileEvent::Touch { id, .. }
            | FileEvent::Truncate { id, .. }
            | FileEvent::Write { id, .. } => *id,
        }
    }
}

/// Callback receiving file events.
pub type FileEventObserver = Arc<dyn Fn(&FileEvent) + Send + Sync>;

/// Identifies a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileEventObserverID(u64);

/// A set of observers.
#[derive(Default)]
pub struct FileEventEmitter {
    observers: DashMap<u64, FileEventObserver>,
    next_id: AtomicU64,
}

impl FileEventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: FileEventObserver) -> FileEventObserverID {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        FileEventObserverID(id)
    }

    /// Returns whether the observer was registered.
    pub fn remove_observer(&self, id: FileEventObserverID) -> bool {
        self.observers.remove(&id.0).is_some()
    }

    /// Calls every observer with `event`.
    ///
    /// Observers are collected before any is called so an observer may add
    /// or remove observers.
    pub fn notify(&self, event: &FileEvent) {
        let observers: Vec<FileEventObserver> = self
            .observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for FileEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventEmitter")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notify_and_remove() {
        let emitter = FileEventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let seen = Arc::clone(&seen);
            emitter.add_observer(Arc::new(move |event: &FileEvent| seen.lock().push(event.clone())))
        };

        let event = FileEvent::Touch {
            id: FileID::from_raw(1),
            modified: 7,
        };
        emitter.notify(&event);
        assert!(emitter.remove_observer(id));
        assert!(!emitter.remove_observer(id));
        emitter.notify(&event);

        assert_eq!(*seen.lock(), vec![event]);
        assert_eq!(seen.lock()[0].id(), FileID::from_raw(1));
    }
}

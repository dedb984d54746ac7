//! In-memory [`Client`] used by tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::client::{
    AccessLevel, Client, DownloadCompletion, NodeInfo, ObserverId, PartialDownload,
    UploadCompletion,
};
use crate::completion::CancelToken;
use crate::error::{ClientError, ErrorOr};
use crate::ids::{BindHandle, NodeHandle};
use crate::node_event::{NodeEvent, NodeEventObserver, NodeEventQueue, NodeEventType};

struct MockNode {
    info: NodeInfo,
    content: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    nodes: HashMap<NodeHandle, MockNode>,
    next_handle: u64,
}

impl MockState {
    fn allocate(&mut self) -> NodeHandle {
        self.next_handle += 1;
        NodeHandle::new(self.next_handle)
    }

    fn child(&self, parent: NodeHandle, name: &str) -> Option<&MockNode> {
        self.nodes
            .values()
            .find(|node| node.info.parent == parent && node.info.name == name)
    }

    fn descendants(&self, handle: NodeHandle) -> Vec<NodeHandle> {
        let mut found = vec![handle];
        let mut index = 0;
        while index < found.len() {
            let current = found[index];
            found.extend(
                self.nodes
                    .values()
                    .filter(|node| node.info.parent == current)
                    .map(|node| node.info.handle),
            );
            index += 1;
        }
        found
    }
}

/// A download started by [`MockClient`].
#[derive(Debug, Default)]
pub struct MockDownload {
    token: CancelToken,
}

impl PartialDownload for MockDownload {
    fn cancel(&self) {
        self.token.cancel();
    }

    fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// An in-memory remote tree.
///
/// Structural changes made through the [`Client`] methods emit node events
/// to registered observers synchronously, after the change is visible.
/// Downloads and uploads complete on a spawned thread.
pub struct MockClient {
    state: Mutex<MockState>,
    root: NodeHandle,
    observers: DashMap<u64, Weak<dyn NodeEventObserver>>,
    next_observer: AtomicU64,
    download_failures: Mutex<VecDeque<ClientError>>,
    download_delay: Mutex<Duration>,
    downloads: Mutex<Vec<(NodeHandle, u64, u64)>>,
    uploads: AtomicU64,
}

impl MockClient {
    /// Creates a client whose tree holds only an empty root directory.
    pub fn new() -> Arc<Self> {
        let mut state = MockState::default();
        let root = state.allocate();
        state.nodes.insert(
            root,
            MockNode {
                info: NodeInfo {
                    handle: root,
                    parent: NodeHandle::UNDEF,
                    name: String::new(),
                    is_directory: true,
                    size: 0,
                    modified: now(),
                    permissions: AccessLevel::Full,
                },
                content: Vec::new(),
            },
        );

        Arc::new(Self {
            state: Mutex::new(state),
            root,
            observers: DashMap::new(),
            next_observer: AtomicU64::new(0),
            download_failures: Mutex::new(VecDeque::new()),
            download_delay: Mutex::new(Duration::ZERO),
            downloads: Mutex::new(Vec::new()),
            uploads: AtomicU64::new(0),
        })
    }

    /// The root directory.
    pub fn root(&self) -> NodeHandle {
        self.root
    }

    /// Adds a directory without emitting events.
    pub fn add_directory(&self, parent: NodeHandle, name: &str) -> NodeHandle {
        self.insert(parent, name, true, Vec::new(), AccessLevel::Full)
    }

    /// Adds a file without emitting events.
    pub fn add_file(&self, parent: NodeHandle, name: &str, content: Vec<u8>) -> NodeHandle {
        self.insert(parent, name, false, content, AccessLevel::Full)
    }

    /// Adds a read-only file without emitting events.
    pub fn add_read_only_file(&self, parent: NodeHandle, name: &str, content: Vec<u8>) -> NodeHandle {
        self.insert(parent, name, false, content, AccessLevel::ReadOnly)
    }

    fn insert(
        &self,
        parent: NodeHandle,
        name: &str,
        is_directory: bool,
        content: Vec<u8>,
        permissions: AccessLevel,
    ) -> NodeHandle {
        let mut state = self.state.lock();
        let handle = state.allocate();
        state.nodes.insert(
            handle,
            MockNode {
                info: NodeInfo {
                    handle,
                    parent,
                    name: name.to_string(),
                    is_directory,
                    size: content.len() as u64,
                    modified: now(),
                    permissions,
                },
                content,
            },
        );
        handle
    }

    /// Current content of a file.
    pub fn content(&self, handle: NodeHandle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .nodes
            .get(&handle)
            .map(|node| node.content.clone())
    }

    /// Replaces a file's content and emits `Modified`.
    pub fn set_content(&self, handle: NodeHandle, content: Vec<u8>) -> ErrorOr<()> {
        let event = {
            let mut state = self.state.lock();
            let node = state.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
            node.info.size = content.len() as u64;
            node.info.modified = now();
            node.content = content;
            event_for(NodeEventType::Modified, &node.info)
        };
        self.emit_one(event);
        Ok(())
    }

    /// Changes a node's permissions and emits `Permissions`.
    pub fn set_permissions(&self, handle: NodeHandle, permissions: AccessLevel) -> ErrorOr<()> {
        let event = {
            let mut state = self.state.lock();
            let node = state.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
            node.info.permissions = permissions;
            event_for(NodeEventType::Permissions, &node.info)
        };
        self.emit_one(event);
        Ok(())
    }

    /// Makes the next `count` downloads fail with `error`.
    pub fn fail_downloads(&self, error: ClientError, count: usize) {
        let mut failures = self.download_failures.lock();
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Delays every download by `delay`.
    pub fn set_download_delay(&self, delay: Duration) {
        *self.download_delay.lock() = delay;
    }

    /// Every download requested so far as `(handle, offset, length)`.
    pub fn downloads(&self) -> Vec<(NodeHandle, u64, u64)> {
        self.downloads.lock().clone()
    }

    /// Number of uploads performed.
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Delivers `events` to every live observer.
    pub fn emit(&self, events: &NodeEventQueue) {
        let observers: Vec<_> = self
            .observers
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        for observer in observers {
            observer.updated(events);
        }
    }

    fn emit_one(&self, event: NodeEvent) {
        let mut queue = NodeEventQueue::new();
        queue.push(event);
        self.emit(&queue);
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

fn event_for(event_type: NodeEventType, info: &NodeInfo) -> NodeEvent {
    NodeEvent::new(event_type, info.handle)
        .with_location(info.parent, info.name.clone())
        .with_directory(info.is_directory)
        .with_content(info.size, info.modified)
        .with_permissions(info.permissions)
}

impl Client for MockClient {
    fn get(&self, handle: NodeHandle) -> ErrorOr<NodeInfo> {
        self.state
            .lock()
            .nodes
            .get(&handle)
            .map(|node| node.info.clone())
            .ok_or(ClientError::NotFound)
    }

    fn lookup(&self, parent: NodeHandle, name: &str) -> ErrorOr<NodeInfo> {
        let state = self.state.lock();
        let parent_node = state.nodes.get(&parent).ok_or(ClientError::NotFound)?;
        if !parent_node.info.is_directory {
            return Err(ClientError::NotDirectory);
        }
        state
            .child(parent, name)
            .map(|node| node.info.clone())
            .ok_or(ClientError::NotFound)
    }

    fn children(&self, parent: NodeHandle) -> ErrorOr<Vec<NodeInfo>> {
        let state = self.state.lock();
        let parent_node = state.nodes.get(&parent).ok_or(ClientError::NotFound)?;
        if !parent_node.info.is_directory {
            return Err(ClientError::NotDirectory);
        }
        let mut children: Vec<NodeInfo> = state
            .nodes
            .values()
            .filter(|node| node.info.parent == parent)
            .map(|node| node.info.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn download(
        &self,
        handle: NodeHandle,
        offset: u64,
        length: u64,
        completion: DownloadCompletion,
    ) -> Arc<dyn PartialDownload> {
        let content = {
            let state = self.state.lock();
            match state.nodes.get(&handle) {
                None => Err(ClientError::NotFound),
                Some(node) if node.info.is_directory => Err(ClientError::IsDirectory),
                Some(node) => {
                    let len = node.content.len() as u64;
                    let begin = usize::try_from(offset.min(len)).unwrap_or(usize::MAX);
                    let end = usize::try_from(offset.saturating_add(length).min(len))
                        .unwrap_or(usize::MAX);
                    Ok(node.content[begin..end].to_vec())
                }
            }
        };

        self.downloads.lock().push((handle, offset, length));
        let failure = self.download_failures.lock().pop_front();
        let delay = *self.download_delay.lock();
        let download = Arc::new(MockDownload::default());
        let token = download.token.clone();

        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if token.is_cancelled() {
                completion.fail(ClientError::Cancelled);
            } else if let Some(error) = failure {
                completion.fail(error);
            } else {
                completion.complete(content);
            }
        });

        download
    }

    fn upload(
        &self,
        content: Vec<u8>,
        parent: NodeHandle,
        name: &str,
        bind_handle: &BindHandle,
        completion: UploadCompletion,
    ) {
        let result = {
            let mut state = self.state.lock();
            match state.nodes.get(&parent) {
                None => Err(ClientError::NotFound),
                Some(node) if !node.info.is_directory => Err(ClientError::NotDirectory),
                Some(_) => match state.child(parent, name).map(|n| (n.info.handle, n.info.is_directory)) {
                    Some((_, true)) => Err(ClientError::IsDirectory),
                    Some((existing, false)) => match state.nodes.get_mut(&existing) {
                        None => Err(ClientError::NotFound),
                        Some(node) => {
                            node.info.size = content.len() as u64;
                            node.info.modified = now();
                            node.content = content;
                            let event = event_for(NodeEventType::Modified, &node.info)
                                .with_bind_handle(bind_handle.clone());
                            Ok((existing, event))
                        }
                    },
                    None => {
                        let handle = state.allocate();
                        let info = NodeInfo {
                            handle,
                            parent,
                            name: name.to_string(),
                            is_directory: false,
                            size: content.len() as u64,
                            modified: now(),
                            permissions: AccessLevel::Full,
                        };
                        let event = event_for(NodeEventType::Added, &info)
                            .with_bind_handle(bind_handle.clone());
                        state.nodes.insert(handle, MockNode { info, content });
                        Ok((handle, event))
                    }
                },
            }
        };

        self.uploads.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok((handle, event)) => {
                self.emit_one(event);
                thread::spawn(move || completion.succeed(handle));
            }
            Err(error) => {
                thread::spawn(move || completion.fail(error));
            }
        }
    }

    fn make_directory(&self, parent: NodeHandle, name: &str) -> ErrorOr<NodeInfo> {
        let info = {
            let mut state = self.state.lock();
            let parent_node = state.nodes.get(&parent).ok_or(ClientError::NotFound)?;
            if !parent_node.info.is_directory {
                return Err(ClientError::NotDirectory);
            }
            if state.child(parent, name).is_some() {
                return Err(ClientError::Exists);
            }
            let handle = state.allocate();
            let info = NodeInfo {
                handle,
                parent,
                name: name.to_string(),
                is_directory: true,
                size: 0,
                modified: now(),
                permissions: AccessLevel::Full,
            };
            state.nodes.insert(
                handle,
                MockNode {
                    info: info.clone(),
                    content: Vec::new(),
                },
            );
            info
        };
        self.emit_one(event_for(NodeEventType::Added, &info));
        Ok(info)
    }

    fn move_node(&self, handle: NodeHandle, new_parent: NodeHandle, new_name: &str) -> ErrorOr<()> {
        let event = {
            let mut state = self.state.lock();
            match state.nodes.get(&new_parent) {
                None => return Err(ClientError::NotFound),
                Some(node) if !node.info.is_directory => return Err(ClientError::NotDirectory),
                Some(_) => {}
            }
            if state.descendants(handle).contains(&new_parent) {
                return Err(ClientError::InvalidArgument("cannot move below itself".into()));
            }
            if let Some(existing) = state.child(new_parent, new_name)
                && existing.info.handle != handle
            {
                return Err(ClientError::Exists);
            }
            let node = state.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
            node.info.parent = new_parent;
            node.info.name = new_name.to_string();
            event_for(NodeEventType::Moved, &node.info)
        };
        self.emit_one(event);
        Ok(())
    }

    fn rename(&self, handle: NodeHandle, new_name: &str) -> ErrorOr<()> {
        let parent = self.get(handle)?.parent;
        self.move_node(handle, parent, new_name)
    }

    fn remove(&self, handle: NodeHandle) -> ErrorOr<()> {
        let events: NodeEventQueue = {
            let mut state = self.state.lock();
            if !state.nodes.contains_key(&handle) {
                return Err(ClientError::NotFound);
            }
            let mut removed = state.descendants(handle);
            // Children before parents.
            removed.reverse();
            removed
                .into_iter()
                .filter_map(|h| state.nodes.remove(&h))
                .map(|node| event_for(NodeEventType::Removed, &node.info))
                .collect()
        };
        self.emit(&events);
        Ok(())
    }

    fn replace(&self, source: NodeHandle, target: NodeHandle) -> ErrorOr<()> {
        let content = self.content(source).ok_or(ClientError::NotFound)?;
        self.set_content(target, content)?;
        self.remove(source)
    }

    fn touch(&self, handle: NodeHandle, modified: i64) -> ErrorOr<()> {
        let event = {
            let mut state = self.state.lock();
            let node = state.nodes.get_mut(&handle).ok_or(ClientError::NotFound)?;
            node.info.modified = modified;
            event_for(NodeEventType::Modified, &node.info)
        };
        self.emit_one(event);
        Ok(())
    }

    fn add_event_observer(&self, observer: Weak<dyn NodeEventObserver>) -> ObserverId {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        self.observers.insert(id, observer);
        ObserverId(id)
    }

    fn remove_event_observer(&self, id: ObserverId) {
        self.observers.remove(&id.0);
    }
}

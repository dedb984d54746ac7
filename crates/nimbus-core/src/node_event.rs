//! Remote change notifications.
//!
//! The cloud client reports changes to the remote tree as batches of
//! [`NodeEvent`]s pushed to every registered [`NodeEventObserver`]. Observers
//! consume a batch front to back; the order is the order the client emitted
//! the events in and must not be changed.

use std::collections::VecDeque;

use crate::client::AccessLevel;
use crate::ids::{BindHandle, NodeHandle};

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEventType {
    /// A node was created.
    Added,
    /// A node's content or attributes changed.
    Modified,
    /// A node was moved or renamed.
    Moved,
    /// A node was removed.
    Removed,
    /// A node's permissions changed.
    Permissions,
}

/// A single change to the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEvent {
    /// What happened.
    pub event_type: NodeEventType,
    /// The affected node.
    pub handle: NodeHandle,
    /// The node's parent after the change.
    pub parent: NodeHandle,
    /// The node's name after the change.
    pub name: String,
    /// Whether the node is a directory.
    pub is_directory: bool,
    /// The node's size after the change.
    pub size: u64,
    /// The node's modification time (seconds since the epoch).
    pub modified: i64,
    /// The node's access level after the change.
    pub permissions: AccessLevel,
    /// Bind handle of the upload that produced the node, if any.
    pub bind_handle: BindHandle,
}

impl NodeEvent {
    /// Creates an event with default attributes.
    pub fn new(event_type: NodeEventType, handle: NodeHandle) -> Self {
        Self {
            event_type,
            handle,
            parent: NodeHandle::UNDEF,
            name: String::new(),
            is_directory: false,
            size: 0,
            modified: 0,
            permissions: AccessLevel::Full,
            bind_handle: BindHandle::default(),
        }
    }

    /// Sets the parent and name.
    #[must_use]
    pub fn with_location(mut self, parent: NodeHandle, name: impl Into<String>) -> Self {
        self.parent = parent;
        self.name = name.into();
        self
    }

    /// Marks the node as a directory.
    #[must_use]
    pub fn with_directory(mut self, is_directory: bool) -> Self {
        self.is_directory = is_directory;
        self
    }

    /// Sets size and modification time.
    #[must_use]
    pub fn with_content(mut self, size: u64, modified: i64) -> Self {
        self.size = size;
        self.modified = modified;
        self
    }

    /// Sets the access level.
    #[must_use]
    pub fn with_permissions(mut self, permissions: AccessLevel) -> Self {
        self.permissions = permissions;
        self
    }

    /// Sets the bind handle.
    #[must_use]
    pub fn with_bind_handle(mut self, bind_handle: BindHandle) -> Self {
        self.bind_handle = bind_handle;
        self
    }
}

/// A FIFO batch of events.
#[derive(Debug, Clone, Default)]
pub struct NodeEventQueue {
    events: VecDeque<NodeEvent>,
}

impl NodeEventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn push(&mut self, event: NodeEvent) {
        self.events.push_back(event);
    }

    /// The oldest event.
    pub fn front(&self) -> Option<&NodeEvent> {
        self.events.front()
    }

    /// Removes and returns the oldest event.
    pub fn pop_front(&mut self) -> Option<NodeEvent> {
        self.events.pop_front()
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates in emission order without consuming.
    pub fn iter(&self) -> impl Iterator<Item = &NodeEvent> {
        self.events.iter()
    }
}

impl FromIterator<NodeEvent> for NodeEventQueue {
    fn from_iter<I: IntoIterator<Item = NodeEvent>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

impl Extend<NodeEvent> for NodeEventQueue {
    fn extend<I: IntoIterator<Item = NodeEvent>>(&mut self, iter: I) {
        self.events.extend(iter);
    }
}

/// Receives batches of remote changes.
///
/// Implementations see each batch exactly once. A batch may be shared by
/// several observers, so implementations should iterate rather than drain
/// unless they are the batch's only consumer.
pub trait NodeEventObserver: Send + Sync {
    /// Called with a batch of events in emission order.
    fn updated(&self, events: &NodeEventQueue);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let mut queue: NodeEventQueue = (1..=3)
            .map(|h| NodeEvent::new(NodeEventType::Modified, NodeHandle::new(h)))
            .collect();

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.front().unwrap().handle, NodeHandle::new(1));
        assert_eq!(queue.pop_front().unwrap().handle, NodeHandle::new(1));
        assert_eq!(queue.pop_front().unwrap().handle, NodeHandle::new(2));
        assert_eq!(queue.pop_front().unwrap().handle, NodeHandle::new(3));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_event_builder() {
        let event = NodeEvent::new(NodeEventType::Added, NodeHandle::new(9))
            .with_location(NodeHandle::new(1), "a.txt")
            .with_content(12, 34);
        assert_eq!(event.name, "a.txt");
        assert_eq!(event.parent, NodeHandle::new(1));
        assert_eq!(event.size, 12);
        assert!(!event.is_directory);
    }
}

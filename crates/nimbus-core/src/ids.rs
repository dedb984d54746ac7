//! Strongly typed identifiers.
//!
//! Three identifier spaces meet in a mounted view:
//!
//! - [`NodeHandle`] names a remote cloud object and is stable across sessions.
//! - [`InodeID`] names an in-memory inode. It is either derived from a
//!   handle or synthesized locally for entities that have no remote node yet.
//! - [`MountInodeID`] is the number handed to the kernel for one mount, where
//!   the mount's root must appear as inode `1`.
//!
//! [`FileID`] identifies a file tracked by the file service and [`BindHandle`]
//! links locally created content to the node it becomes once uploaded.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handles are 48 bits wide.
const HANDLE_MASK: u64 = (1 << 48) - 1;

/// Tag distinguishing synthetic inode IDs from handle-derived ones.
const SYNTHETIC_TAG: u64 = 1 << 63;

/// Tag applied to every non-root [`MountInodeID`].
const MOUNT_TAG: u64 = 1 << 62;

/// Opaque identifier of a remote cloud object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeHandle(u64);

impl NodeHandle {
    /// The "no node" handle.
    pub const UNDEF: NodeHandle = NodeHandle(HANDLE_MASK);

    /// Creates a handle from its 48-bit value. Higher bits are discarded.
    pub const fn new(value: u64) -> Self {
        Self(value & HANDLE_MASK)
    }

    /// Raw 48-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is [`NodeHandle::UNDEF`].
    pub const fn is_undef(self) -> bool {
        self.0 == HANDLE_MASK
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::UNDEF
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undef() {
            return f.write_str("undef");
        }
        write!(f, "{:012x}", self.0)
    }
}

/// Local identifier of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeID(u64);

impl InodeID {
    /// Largest counter value a synthetic ID can carry.
    pub const MAX_SYNTHETIC: u64 = MOUNT_TAG - 1;

    /// Derives an ID from a remote handle.
    pub const fn from_handle(handle: NodeHandle) -> Self {
        Self(handle.as_u64())
    }

    /// Creates a synthetic ID from a local counter.
    ///
    /// Returns `None` once the counter leaves the synthetic space.
    pub const fn synthetic(counter: u64) -> Option<Self> {
        if counter > Self::MAX_SYNTHETIC {
            return None;
        }
        Some(Self(SYNTHETIC_TAG | counter))
    }

    /// Rebuilds an ID from a value previously returned by [`InodeID::as_u64`].
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this ID was synthesized locally.
    pub const fn is_synthetic(self) -> bool {
        self.0 & SYNTHETIC_TAG != 0
    }

    /// The handle this ID was derived from, if any.
    pub const fn handle(self) -> Option<NodeHandle> {
        if self.is_synthetic() {
            return None;
        }
        Some(NodeHandle::new(self.0))
    }
}

impl From<NodeHandle> for InodeID {
    fn from(handle: NodeHandle) -> Self {
        Self::from_handle(handle)
    }
}

impl fmt::Display for InodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synthetic() {
            write!(f, "s{}", self.0 & !SYNTHETIC_TAG)
        } else {
            write!(f, "h{:012x}", self.0)
        }
    }
}

/// Inode number presented to the kernel for a particular mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountInodeID(u64);

impl MountInodeID {
    /// The kernel's root inode number.
    pub const ROOT: MountInodeID = MountInodeID(1);

    /// Maps an inode to its kernel-facing number within a mount rooted at `root`.
    pub const fn map(id: InodeID, root: InodeID) -> Self {
        if id.as_u64() == root.as_u64() {
            return Self::ROOT;
        }
        Self(id.as_u64() | MOUNT_TAG)
    }

    /// Maps a kernel-facing number back to the inode it names.
    pub const fn unmap(self, root: InodeID) -> InodeID {
        if self.0 == Self::ROOT.0 {
            return root;
        }
        InodeID(self.0 & !MOUNT_TAG)
    }

    /// Wraps a number received from the kernel.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MountInodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a file tracked by the file service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileID(u64);

impl FileID {
    /// Wraps a raw value.
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FileID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Key binding locally created content to the node it becomes once uploaded.
///
/// The empty bind handle means "unbound".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BindHandle(String);

impl BindHandle {
    /// Wraps an existing key.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let value: u128 = rand::rng().random();
        Self(format!("{value:032x}"))
    }

    /// Whether this handle is unbound.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BindHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_handle_is_masked() {
        let handle = NodeHandle::new(u64::MAX);
        assert_eq!(handle, NodeHandle::UNDEF);
        assert!(handle.is_undef());
        assert!(!NodeHandle::new(42).is_undef());
    }

    #[test]
    fn test_synthetic_round_trip() {
        let id = InodeID::synthetic(7).unwrap();
        assert!(id.is_synthetic());
        assert_eq!(id.handle(), None);
        assert_eq!(InodeID::from_raw(id.as_u64()), id);
        assert!(InodeID::synthetic(InodeID::MAX_SYNTHETIC + 1).is_none());
    }

    #[test]
    fn test_mount_root_maps_to_one() {
        let root = InodeID::from_handle(NodeHandle::new(1));
        assert_eq!(MountInodeID::map(root, root), MountInodeID::ROOT);
        assert_eq!(MountInodeID::ROOT.unmap(root), root);
    }

    #[test]
    fn test_bind_handle_generate_is_unique() {
        let a = BindHandle::generate();
        let b = BindHandle::generate();
        assert!(!a.is_empty());
        assert_ne!(a, b);
        assert!(BindHandle::default().is_empty());
    }

    proptest! {
        #[test]
        fn prop_synthetic_never_collides_with_handle(handle in any::<u64>(), counter in 0..=InodeID::MAX_SYNTHETIC) {
            let derived = InodeID::from_handle(NodeHandle::new(handle));
            let synthetic = InodeID::synthetic(counter).unwrap();
            prop_assert_ne!(derived, synthetic);
            prop_assert!(!derived.is_synthetic());
            prop_assert!(synthetic.is_synthetic());
        }

        #[test]
        fn prop_mount_inode_mapping_is_bijective(
            root in any::<u64>(),
            handle in any::<u64>(),
            counter in 0..=InodeID::MAX_SYNTHETIC,
        ) {
            let root = InodeID::from_handle(NodeHandle::new(root));
            for id in [InodeID::from_handle(NodeHandle::new(handle)), InodeID::synthetic(counter).unwrap()] {
                let mapped = MountInodeID::map(id, root);
                prop_assert_eq!(mapped.unmap(root), id);
                if id != root {
                    prop_assert_ne!(mapped, MountInodeID::ROOT);
                }
            }
        }
    }
}

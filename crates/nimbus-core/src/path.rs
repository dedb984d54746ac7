//! Lexically normalized local paths.
//!
//! Mount records compare local paths for equality and containment. Doing
//! that through the filesystem would block on unresponsive mounts, so
//! [`NormalizedPath`] canonicalizes purely lexically:
//!
//! - `.` components are dropped
//! - `..` pops the previous component (never above the root)
//! - repeated and trailing separators are trimmed, except for the root itself

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A path whose equality is purely lexical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedPath(PathBuf);

impl NormalizedPath {
    /// Normalizes `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let mut normalized = PathBuf::new();

        for component in path.as_ref().components() {
            match component {
                Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
                Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    // Stay at the root (or drive root) rather than escaping it.
                    if matches!(
                        normalized.components().next_back(),
                        Some(Component::Normal(_))
                    ) {
                        normalized.pop();
                    } else if !normalized.has_root() {
                        normalized.push("..");
                    }
                }
                Component::Normal(name) => normalized.push(name),
            }
        }

        Self(normalized)
    }

    /// The normalized path.
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Whether the path is empty.
    pub fn is_empty(&self) -> bool {
        self.0.as_os_str().is_empty()
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &NormalizedPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// The final component, if any.
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    /// Lossy string form used for persistence.
    pub fn to_string_lossy(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }
}

impl From<&str> for NormalizedPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<PathBuf> for NormalizedPath {
    fn from(path: PathBuf) -> Self {
        Self::new(path)
    }
}

impl AsRef<Path> for NormalizedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Serialize for NormalizedPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string_lossy())
    }
}

impl<'de> Deserialize<'de> for NormalizedPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_separators_are_trimmed() {
        assert_eq!(NormalizedPath::new("/mnt/cloud/"), NormalizedPath::new("/mnt/cloud"));
        assert_eq!(NormalizedPath::new("/mnt//cloud///"), NormalizedPath::new("/mnt/cloud"));
    }

    #[test]
    fn test_root_is_kept() {
        let root = NormalizedPath::new("/");
        assert_eq!(root.as_path(), Path::new("/"));
        assert_eq!(NormalizedPath::new("//"), root);
    }

    #[test]
    fn test_dot_components() {
        assert_eq!(NormalizedPath::new("/mnt/./a/../b"), NormalizedPath::new("/mnt/b"));
        assert_eq!(NormalizedPath::new("/../.."), NormalizedPath::new("/"));
        assert_eq!(NormalizedPath::new("a/../../b"), NormalizedPath::new("../b"));
    }

    #[test]
    fn test_prefix() {
        let parent = NormalizedPath::new("/mnt");
        let child = NormalizedPath::new("/mnt/cloud/x");
        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_prefix_of(&parent));
        assert!(!NormalizedPath::new("/mn").is_prefix_of(&child));
    }

    #[test]
    fn test_serde_normalizes() {
        let path: NormalizedPath = serde_json::from_str("\"/mnt/cloud/\"").unwrap();
        assert_eq!(path, NormalizedPath::new("/mnt/cloud"));
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"/mnt/cloud\"");
    }
}

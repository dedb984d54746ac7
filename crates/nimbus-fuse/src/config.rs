//! Tunables for the inode cache, mounts and the service as a whole.
//!
//! Every flag set has a `Default`, `#[must_use]` builders and a serde
//! representation with human-readable durations, so a whole
//! [`ServiceFlags`] can be read from JSON:
//!
//! ```
//! use nimbus_fuse::ServiceFlags;
//! use std::time::Duration;
//!
//! let flags: ServiceFlags = serde_json::from_str(
//!     r#"{ "inode_cache": { "clean_interval": "30s" }, "disable_timeout": "1m" }"#,
//! ).unwrap();
//! assert_eq!(flags.inode_cache.clean_interval, Duration::from_secs(30));
//! assert_eq!(flags.disable_timeout, Duration::from_secs(60));
//! ```

use nimbus_core::TaskExecutorFlags;
use nimbus_file_service::FileServiceOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of unreferenced inodes kept in memory.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 4096;

/// Default cache size the cleaner reduces to.
pub const DEFAULT_CLEAN_SIZE_THRESHOLD: usize = 1024;

/// Default age past which cached inodes are always evicted.
pub const DEFAULT_CLEAN_AGE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default interval between cleaner passes.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Default delay between closing a modified file and uploading it.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(4);

/// Default bound on how long disabling a mount may wait for open contexts.
pub const DEFAULT_DISABLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sizing of the inode cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InodeCacheFlags {
    /// Adding past this many entries evicts the oldest at once.
    pub max_size: usize,
    /// The cleaner evicts from the oldest end until at most this many remain.
    pub clean_size_threshold: usize,
    /// The cleaner evicts entries older than this regardless of size.
    #[serde(with = "humantime_serde")]
    pub clean_age_threshold: Duration,
    /// How often the cleaner runs.
    #[serde(with = "humantime_serde")]
    pub clean_interval: Duration,
}

impl Default for InodeCacheFlags {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_CACHE_MAX_SIZE,
            clean_size_threshold: DEFAULT_CLEAN_SIZE_THRESHOLD,
            clean_age_threshold: DEFAULT_CLEAN_AGE_THRESHOLD,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
        }
    }
}

impl InodeCacheFlags {
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    #[must_use]
    pub fn with_clean_size_threshold(mut self, threshold: usize) -> Self {
        self.clean_size_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_clean_age_threshold(mut self, threshold: Duration) -> Self {
        self.clean_age_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval;
        self
    }
}

/// User-facing settings of a mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct MountFlags {
    /// Unique name of the mount.
    pub name: String,
    /// Enable the mount whenever the service starts.
    pub enable_at_startup: bool,
    /// Keep the mount's record across restarts.
    pub persistent: bool,
    /// Refuse every modification through the mount.
    pub read_only: bool,
}

impl MountFlags {
    /// Flags for a transient, writable mount called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_enable_at_startup(mut self, enable: bool) -> Self {
        self.enable_at_startup = enable;
        self
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Configuration of a [`Service`](crate::Service) and everything it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceFlags {
    pub executor: TaskExecutorFlags,
    pub inode_cache: InodeCacheFlags,
    pub file_service: FileServiceOptions,
    /// Delay before a modified file is uploaded once its last handle closes.
    #[serde(with = "humantime_serde")]
    pub flush_delay: Duration,
    /// Watchdog deadline for draining a mount's contexts on disable.
    #[serde(with = "humantime_serde")]
    pub disable_timeout: Duration,
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self {
            executor: TaskExecutorFlags::default(),
            inode_cache: InodeCacheFlags::default(),
            file_service: FileServiceOptions::default(),
            flush_delay: DEFAULT_FLUSH_DELAY,
            disable_timeout: DEFAULT_DISABLE_TIMEOUT,
        }
    }
}

impl ServiceFlags {
    #[must_use]
    pub fn with_executor(mut self, executor: TaskExecutorFlags) -> Self {
        self.executor = executor;
        self
    }

    #[must_use]
    pub fn with_inode_cache(mut self, inode_cache: InodeCacheFlags) -> Self {
        self.inode_cache = inode_cache;
        self
    }

    #[must_use]
    pub fn with_file_service(mut self, file_service: FileServiceOptions) -> Self {
        self.file_service = file_service;
        self
    }

    #[must_use]
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    #[must_use]
    pub fn with_disable_timeout(mut self, timeout: Duration) -> Self {
        self.disable_timeout = timeout;
        self
    }
}

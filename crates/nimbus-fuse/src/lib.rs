//! Inode registry, mount lifecycle and filesystem contexts for exposing a
//! nimbus cloud tree through the operating system.
//!
//! The kernel-facing layer is supplied by a [`MountPlatform`]; this crate
//! provides everything behind it:
//!
//! - [`inode`] / [`inode_db`]: reference-counted inodes materialized from
//!   the remote tree, with an LRU cache of recently used ones
//! - [`mount`] / [`mount_db`]: mounts, their persisted records and their
//!   lifecycle from added to enabled and back
//! - [`context`]: blocking directory and file contexts over the
//!   [`FileService`](nimbus_file_service::FileService)
//! - [`service`]: one object wiring the stack together, including the
//!   dispatch of the client's node events
//!
//! # Example
//!
//! ```no_run
//! use nimbus_core::{Client, NodeHandle};
//! use nimbus_fuse::{MountFlags, MountInfo, MountPlatform, Service, ServiceFlags};
//! use std::sync::Arc;
//!
//! # fn run(client: Arc<dyn Client>, platform: Arc<dyn MountPlatform>) -> nimbus_fuse::FuseResult<()> {
//! let service = Service::new(client, platform, "/var/lib/nimbus", ServiceFlags::default())?;
//! let info = MountInfo::new(MountFlags::new("docs"), NodeHandle::new(42), "/mnt/docs");
//! assert!(service.mounts().add(info).is_success());
//! assert!(service.mounts().enable("docs", true).is_success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
mod dispatcher;
pub mod error;
pub mod inode;
mod inode_cache;
pub mod inode_db;
pub mod mount;
pub mod mount_db;
pub mod reference;
pub mod service;

pub use config::{InodeCacheFlags, MountFlags, ServiceFlags};
pub use context::{Attributes, DirectoryContext, FileHandleContext};
pub use error::{FuseError, FuseResult, MountResult};
pub use inode::{DirectoryInode, FileInode, Inode, InodeInfo, InodeKind, InodeRef};
pub use inode_db::InodeDB;
pub use mount::{ActivityGuard, Mount, MountInfo, MountPlatform, MountSession, MountState};
pub use mount_db::{MountDB, MountEvent, MountEventType};
pub use reference::{Badge, Ref, Referenced};
pub use service::Service;

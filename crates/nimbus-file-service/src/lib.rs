//! Partial-content cache for cloud files.
//!
//! The [`FileService`] keeps the bytes of remote files in local storage one
//! range at a time. Reads download only the holes they touch, writes are
//! kept locally until [`FileContext::flush`] uploads them, and clean
//! content is reclaimed least recently used first once storage use passes
//! a threshold.
//!
//! # Modules
//!
//! - [`range`] / [`range_tree`]: byte intervals and the merged set of them
//!   recording which parts of a file are resident
//! - [`rw_state`]: the per-file reader/writer gate and its request FIFO
//! - [`info`] / [`event`]: shared file attributes and change notifications
//! - [`context`]: per-file request processing and range downloads
//! - [`service`]: file identity, persistence, node events and reclamation
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use nimbus_core::{Completion, Database, NodeHandle, TaskExecutor, TaskExecutorFlags};
//! use nimbus_file_service::{FileService, FileServiceOptions, FileRange};
//! use std::sync::Arc;
//!
//! # fn run(client: Arc<dyn nimbus_core::Client>) -> Result<(), Box<dyn std::error::Error>> {
//! let database = Arc::new(Database::open("/var/lib/nimbus/state.db")?);
//! let executor = Arc::new(TaskExecutor::new("files", TaskExecutorFlags::default()));
//! let service = FileService::new(
//!     client,
//!     database,
//!     executor,
//!     "/var/lib/nimbus/content",
//!     FileServiceOptions::default(),
//! )?;
//! service.observe_client();
//!
//! let id = service.add(NodeHandle::new(42))?;
//! let file = service.open(id)?;
//! file.read(
//!     FileRange::new(0, 4096),
//!     Completion::new(|result: Result<Bytes, _>| println!("read {:?} bytes", result.map(|b| b.len()))),
//! );
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod info;
pub mod options;
mod queries;
pub mod range;
pub mod range_tree;
pub mod rw_state;
pub mod service;

pub use context::FileContext;
pub use error::{FileError, FileRangeError, FileResult, FileServiceError, FileServiceResult};
pub use event::{FileEvent, FileEventEmitter, FileEventObserver, FileEventObserverID};
pub use info::{FileInfo, FileInfoContext, FileLocation};
pub use options::FileServiceOptions;
pub use range::FileRange;
pub use range_tree::FileRangeTree;
pub use rw_state::{FileReadWriteState, GatedRequest, RequestKind, RequestQueue};
pub use service::FileService;

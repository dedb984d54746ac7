//! Wires the stack together.
//!
//! A [`Service`] owns one database, one executor, one watchdog, the inode
//! registry, the file service, the mount database and the node event
//! dispatcher. Mounts and their contexts share one service context.

use nimbus_core::watchdog::abort_process;
use nimbus_core::{AbortHandler, Client, Database, TaskExecutor, Watchdog};
use nimbus_file_service::FileService;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::config::ServiceFlags;
use crate::dispatcher::NodeEventDispatcher;
use crate::error::FuseResult;
use crate::inode_db::InodeDB;
use crate::mount::MountPlatform;
use crate::mount_db::MountDB;

const DATABASE_FILE: &str = "nimbus.db";
const FILES_DIRECTORY: &str = "files";

/// State shared by mounts and their contexts.
pub(crate) struct ServiceContext {
    pub(crate) client: Arc<dyn Client>,
    pub(crate) database: Arc<Database>,
    pub(crate) executor: Arc<TaskExecutor>,
    pub(crate) watchdog: Watchdog,
    pub(crate) inode_db: Arc<InodeDB>,
    pub(crate) file_service: Arc<FileService>,
    pub(crate) flags: RwLock<ServiceFlags>,
}

/// The mount service.
pub struct Service {
    // Dropped first so mounts drain while everything else is alive.
    mounts: MountDB,
    dispatcher: Arc<NodeEventDispatcher>,
    context: Arc<ServiceContext>,
    shut_down: AtomicBool,
}

impl Service {
    /// Starts a service keeping its state under `storage`.
    ///
    /// A watchdog expiry aborts the process.
    pub fn new(
        client: Arc<dyn Client>,
        platform: Arc<dyn MountPlatform>,
        storage: impl AsRef<Path>,
        flags: ServiceFlags,
    ) -> FuseResult<Self> {
        Self::with_abort_handler(client, platform, storage, flags, abort_process())
    }

    /// Like [`new`](Self::new), calling `abort` on watchdog expiry.
    pub fn with_abort_handler(
        client: Arc<dyn Client>,
        platform: Arc<dyn MountPlatform>,
        storage: impl AsRef<Path>,
        flags: ServiceFlags,
        abort: AbortHandler,
    ) -> FuseResult<Self> {
        let storage = storage.as_ref();
        std::fs::create_dir_all(storage)?;

        let database = Arc::new(Database::open(storage.join(DATABASE_FILE))?);
        let executor = Arc::new(TaskExecutor::new("nimbus", flags.executor.clone()));
        let inode_db = InodeDB::new(
            Arc::clone(&client),
            Arc::clone(&database),
            flags.inode_cache.clone(),
        )?;
        let file_service = FileService::new(
            Arc::clone(&client),
            Arc::clone(&database),
            Arc::clone(&executor),
            storage.join(FILES_DIRECTORY),
            flags.file_service.clone(),
        )?;
        let dispatcher = NodeEventDispatcher::start(
            Arc::clone(&client),
            Arc::clone(&inode_db),
            Arc::clone(&file_service),
        );

        let context = Arc::new(ServiceContext {
            client,
            database,
            executor,
            watchdog: Watchdog::new(abort),
            inode_db,
            file_service,
            flags: RwLock::new(flags),
        });
        let mounts = MountDB::new(Arc::clone(&context), platform)?;

        info!(
            storage = %storage.display(),
            mounts = mounts.mounts().len(),
            "Service started"
        );
        Ok(Self {
            mounts,
            dispatcher,
            context,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn mounts(&self) -> &MountDB {
        &self.mounts
    }

    pub fn inode_db(&self) -> &Arc<InodeDB> {
        &self.context.inode_db
    }

    pub fn file_service(&self) -> &Arc<FileService> {
        &self.context.file_service
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.context.executor
    }

    pub fn flags(&self) -> ServiceFlags {
        self.context.flags.read().clone()
    }

    /// Applies new flags to every component.
    pub fn set_flags(&self, flags: ServiceFlags) {
        self.context.executor.set_flags(flags.executor.clone());
        self.context.inode_db.set_cache_flags(flags.inode_cache.clone());
        self.context.file_service.set_options(flags.file_service.clone());
        *self.context.flags.write() = flags;
        debug!("Service flags updated");
    }

    /// While set, node events are not applied to inodes.
    pub fn discard(&self, discard: bool) {
        self.context.inode_db.discard(discard);
    }

    /// Blocks until every node event received so far has been applied.
    pub fn sync(&self) {
        self.dispatcher.sync();
    }

    /// Disables every mount and stops background work. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Service shutting down");
        self.mounts.disable_all();
        self.dispatcher.stop();
        self.context.executor.shutdown();
        info!("Service stopped");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("mounts", &self.mounts)
            .field("inode_db", &self.context.inode_db)
            .finish_non_exhaustive()
    }
}

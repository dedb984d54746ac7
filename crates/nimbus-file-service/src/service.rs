//! The file service: file identity, persistence and storage reclamation.

use dashmap::DashMap;
use nimbus_core::{
    BindHandle, Client, ClientError, Completion, Database, DatabaseResult, FileID, NodeEventObserver,
    NodeEventQueue, NodeEventType, NodeHandle, ObserverId, Task, TaskExecutor, Transaction,
};
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::context::FileContext;
use crate::error::{FileError, FileServiceError, FileServiceResult};
use crate::event::{FileEventEmitter, FileEventObserver, FileEventObserverID};
use crate::info::{FileInfo, FileInfoContext, FileLocation, InfoIndex, now};
use crate::options::FileServiceOptions;
use crate::queries::{self, from_sql, to_sql};
use crate::range::FileRange;

/// State shared between the service and its open files.
pub(crate) struct ServiceContext {
    pub(crate) client: Arc<dyn Client>,
    pub(crate) database: Arc<Database>,
    pub(crate) executor: Arc<TaskExecutor>,
    options: RwLock<FileServiceOptions>,
    storage: PathBuf,
    emitter: Arc<FileEventEmitter>,
    infos: Arc<InfoIndex>,
    pub(crate) files: DashMap<FileID, Weak<FileContext>>,
    /// Uploads in flight, so their echoed node events can be recognised.
    pub(crate) uploads: DashMap<BindHandle, FileID>,
}

impl ServiceContext {
    pub(crate) fn options(&self) -> FileServiceOptions {
        self.options.read().clone()
    }

    /// Runs `f` in a transaction and commits it.
    pub(crate) fn persist<F>(&self, f: F) -> DatabaseResult<()>
    where
        F: FnOnce(&Transaction<'_>) -> DatabaseResult<()>,
    {
        let tx = self.database.transaction()?;
        f(&tx)?;
        tx.commit()
    }

    fn live_info(&self, id: FileID) -> Option<Arc<FileInfoContext>> {
        self.infos.get(&id).and_then(|entry| entry.upgrade())
    }

    fn live_file(&self, id: FileID) -> Option<Arc<FileContext>> {
        self.files.get(&id).and_then(|entry| entry.upgrade())
    }

    /// Reports that another file's node now belongs to someone else.
    pub(crate) fn replaced(&self, id: FileID) {
        if let Some(info) = self.live_info(id) {
            info.removed(true);
        }
    }

    fn storage_path(&self, id: FileID) -> PathBuf {
        self.storage.join(id.to_string())
    }
}

/// Tracks cached file content for a cloud client.
///
/// Files are identified by a [`FileID`] that survives restarts. A file
/// either mirrors a remote node (added with [`add`](Self::add)) or was
/// created locally and is bound to a node by its first flush.
pub struct FileService {
    context: Arc<ServiceContext>,
    this: Weak<FileService>,
    open_lock: Mutex<()>,
    reclaim_task: Mutex<Option<Task>>,
    observer: Mutex<Option<ObserverId>>,
}

impl FileService {
    /// Opens the service over `database`, keeping content under `storage`.
    ///
    /// Files marked removed by an earlier run are purged.
    pub fn new(
        client: Arc<dyn Client>,
        database: Arc<Database>,
        executor: Arc<TaskExecutor>,
        storage: impl AsRef<Path>,
        options: FileServiceOptions,
    ) -> FileServiceResult<Arc<Self>> {
        database.migrate(queries::COMPONENT, queries::MIGRATIONS)?;
        let storage = storage.as_ref().to_path_buf();
        std::fs::create_dir_all(&storage)?;

        let reclaim_delay = options.reclaim_delay;
        let service = Arc::new_cyclic(|this| Self {
            context: Arc::new(ServiceContext {
                client,
                database,
                executor,
                options: RwLock::new(options),
                storage,
                emitter: Arc::new(FileEventEmitter::new()),
                infos: Arc::new(InfoIndex::new()),
                files: DashMap::new(),
                uploads: DashMap::new(),
            }),
            this: this.clone(),
            open_lock: Mutex::new(()),
            reclaim_task: Mutex::new(None),
            observer: Mutex::new(None),
        });

        let purged = service.purge()?;
        service.schedule_reclaim(reclaim_delay);
        info!(
            storage = %service.context.storage.display(),
            purged,
            "File service started"
        );
        Ok(service)
    }

    /// Registers the service for the client's node events.
    ///
    /// Not needed when a dispatcher forwards batches through [`apply`](Self::apply).
    pub fn observe_client(self: &Arc<Self>) {
        let mut observer = self.observer.lock();
        if observer.is_none() {
            let this: Arc<dyn NodeEventObserver> = Arc::<Self>::clone(self);
            *observer = Some(self.context.client.add_event_observer(Arc::downgrade(&this)));
        }
    }

    /// Starts tracking the remote file `handle`. Adding a handle twice
    /// returns the same ID.
    pub fn add(&self, handle: NodeHandle) -> FileServiceResult<FileID> {
        let node = self.context.client.get(handle)?;
        if node.is_directory {
            return Err(ClientError::IsDirectory.into());
        }

        let _guard = self.open_lock.lock();
        if let Some(id) = self.file_for(handle)? {
            return Ok(id);
        }

        let accessed = now();
        let tx = self.context.database.transaction()?;
        let id = queries::allocate_id(&tx)?;
        queries::insert_file(
            &tx,
            &FileInfo {
                id,
                handle,
                location: FileLocation::new(node.parent, node.name),
                size: node.size,
                modified: node.modified,
                accessed,
                allocated_size: 0,
                reported_size: node.size,
                dirty: false,
                removed: false,
            },
        )?;
        tx.commit()?;

        debug!(%id, %handle, size = node.size, "File added");
        Ok(id)
    }

    /// Creates an empty local file to be uploaded as `name` under `parent`.
    pub fn create(&self, parent: NodeHandle, name: &str) -> FileServiceResult<Arc<FileContext>> {
        let id = {
            let _guard = self.open_lock.lock();
            let modified = now();
            let tx = self.context.database.transaction()?;
            let id = queries::allocate_id(&tx)?;
            queries::insert_file(
                &tx,
                &FileInfo {
                    id,
                    handle: NodeHandle::UNDEF,
                    location: FileLocation::new(parent, name),
                    size: 0,
                    modified,
                    accessed: modified,
                    allocated_size: 0,
                    reported_size: 0,
                    dirty: true,
                    removed: false,
                },
            )?;
            tx.commit()?;
            id
        };

        debug!(%id, %parent, name, "File created");
        self.open(id)
    }

    /// Opens `id`, returning the live context if the file is already open.
    pub fn open(&self, id: FileID) -> FileServiceResult<Arc<FileContext>> {
        let _guard = self.open_lock.lock();
        if let Some(context) = self.context.live_file(id) {
            return Ok(context);
        }

        let (info, ranges) = {
            let tx = self.context.database.transaction()?;
            let info = {
                let mut query = tx.query(queries::SELECT_FILE);
                query.param(":id", to_sql(id.as_u64()));
                query.execute()?;
                match query.first() {
                    Some(row) => queries::file_from_row(&row)?,
                    None => return Err(FileServiceError::UnknownFile(id)),
                }
            };
            let ranges = queries::load_ranges(&tx, id, 1)?;
            tx.commit()?;
            (info, ranges)
        };
        if info.removed {
            return Err(FileServiceError::Removed(id));
        }

        let read_only = !info.handle.is_undef()
            && self
                .context
                .client
                .permissions(info.handle)
                .is_ok_and(|access| !access.writable());

        let storage = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.context.storage_path(id))?;

        let info = match self.context.live_info(id) {
            Some(existing) => existing,
            None => FileInfoContext::new(info, Arc::clone(&self.context.emitter), &self.context.infos),
        };
        let context = FileContext::new(info, Arc::clone(&self.context), storage, ranges, read_only);
        self.context.files.insert(id, Arc::downgrade(&context));

        trace!(%id, read_only, "File opened");
        Ok(context)
    }

    /// The live file bound to `handle`, if any.
    pub fn file_for(&self, handle: NodeHandle) -> FileServiceResult<Option<FileID>> {
        let mut query = self.context.database.query(queries::SELECT_FILE_BY_HANDLE);
        query.param(":handle", to_sql(handle.as_u64()));
        query.execute()?;
        match query.first() {
            Some(row) => Ok(Some(FileID::from_raw(from_sql(row.field("id")?)))),
            None => Ok(None),
        }
    }

    /// Attributes of `id`.
    pub fn info(&self, id: FileID) -> FileServiceResult<FileInfo> {
        if let Some(info) = self.context.live_info(id) {
            return Ok(info.snapshot());
        }
        let mut query = self.context.database.query(queries::SELECT_FILE);
        query.param(":id", to_sql(id.as_u64()));
        query.execute()?;
        match query.first() {
            Some(row) => Ok(queries::file_from_row(&row)?),
            None => Err(FileServiceError::UnknownFile(id)),
        }
    }

    /// Byte ranges of `id` present in local storage.
    pub fn ranges(&self, id: FileID) -> FileServiceResult<Vec<FileRange>> {
        if let Some(context) = self.context.live_file(id) {
            return Ok(context.ranges());
        }
        let tx = self.context.database.transaction()?;
        let ranges = queries::load_ranges(&tx, id, 1)?;
        tx.commit()?;
        Ok(ranges.ranges())
    }

    /// Bytes of local storage in use.
    pub fn storage_used(&self) -> FileServiceResult<u64> {
        let mut query = self.context.database.query(queries::SELECT_STORAGE_USED);
        query.execute()?;
        match query.first() {
            Some(row) => Ok(from_sql(row.field("used")?)),
            None => Ok(0),
        }
    }

    /// Files a reclaim would release, least recently accessed first, with
    /// the bytes each holds.
    ///
    /// Only clean files not accessed within the age threshold qualify, and
    /// the list stops once releasing it would bring usage down to the size
    /// threshold.
    pub fn reclaimable(&self) -> FileServiceResult<Vec<(FileID, u64)>> {
        let options = self.context.options();
        let mut used = self.storage_used()?;
        if used <= options.reclaim_size_threshold {
            return Ok(Vec::new());
        }

        let age = i64::try_from(options.reclaim_age_threshold.as_secs()).unwrap_or(i64::MAX);
        let mut query = self.context.database.query(queries::SELECT_RECLAIMABLE);
        query.param(":accessed", now().saturating_sub(age));
        query.execute()?;

        let mut candidates = Vec::new();
        for row in query.rows() {
            if used <= options.reclaim_size_threshold {
                break;
            }
            let id = FileID::from_raw(from_sql(row.field("id")?));
            let allocated = from_sql(row.field("allocated_size")?);
            candidates.push((id, allocated));
            used = used.saturating_sub(allocated);
        }
        Ok(candidates)
    }

    /// Reclaims the files listed by [`reclaimable`](Self::reclaimable) and
    /// reports the total bytes released.
    pub fn reclaim(&self, completion: Completion<u64, FileError>) {
        let candidates = match self.reclaimable() {
            Ok(candidates) => candidates,
            Err(e) => {
                completion.fail(FileError::Failed(e.to_string()));
                return;
            }
        };
        if candidates.is_empty() {
            completion.succeed(0);
            return;
        }

        debug!(files = candidates.len(), "Reclaiming storage");
        let tally = Arc::new(Mutex::new(Tally {
            remaining: candidates.len(),
            reclaimed: 0,
            completion: Some(completion),
        }));
        for (id, _) in candidates {
            match self.open(id) {
                Ok(context) => {
                    let tally = Arc::clone(&tally);
                    context.reclaim(Completion::new(move |result| {
                        let reclaimed = match result {
                            Ok(reclaimed) => reclaimed,
                            Err(e) => {
                                warn!(%id, error = %e, "Failed to reclaim file");
                                0
                            }
                        };
                        Tally::settle(&tally, reclaimed);
                    }));
                }
                Err(e) => {
                    warn!(%id, error = %e, "Failed to open file for reclaim");
                    Tally::settle(&tally, 0);
                }
            }
        }
    }

    /// Deletes files marked removed that are not open, along with their
    /// content. Returns how many were deleted.
    pub fn purge(&self) -> FileServiceResult<usize> {
        let _guard = self.open_lock.lock();
        let removed: Vec<FileID> = {
            let mut query = self.context.database.query(queries::SELECT_REMOVED);
            query.execute()?;
            query
                .rows()
                .map(|row| row.field::<i64>("id").map(|id| FileID::from_raw(from_sql(id))))
                .collect::<DatabaseResult<_>>()?
        };

        let mut purged = 0;
        for id in removed {
            if self.context.live_file(id).is_some() {
                continue;
            }
            self.context.persist(|tx| queries::release_id(tx, id))?;
            match std::fs::remove_file(self.context.storage_path(id)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(%id, error = %e, "Failed to delete file content"),
            }
            purged += 1;
        }
        if purged > 0 {
            debug!(purged, "Purged removed files");
        }
        Ok(purged)
    }

    pub fn options(&self) -> FileServiceOptions {
        self.context.options()
    }

    /// Replaces the options and reschedules periodic reclaim.
    pub fn set_options(&self, options: FileServiceOptions) {
        let delay = options.reclaim_delay;
        *self.context.options.write() = options;
        self.schedule_reclaim(delay);
    }

    /// Observes events for every file.
    pub fn add_observer(&self, observer: FileEventObserver) -> FileEventObserverID {
        self.context.emitter.add_observer(observer)
    }

    pub fn remove_observer(&self, id: FileEventObserverID) -> bool {
        self.context.emitter.remove_observer(id)
    }

    /// Applies a batch of node events to the files they concern.
    pub fn apply(&self, events: &NodeEventQueue) {
        for event in events.iter() {
            if event.is_directory {
                continue;
            }
            if !event.bind_handle.is_empty() && self.context.uploads.contains_key(&event.bind_handle) {
                trace!(handle = %event.handle, "Skipping event for own upload");
                continue;
            }

            let id = match self.file_for(event.handle) {
                Ok(Some(id)) => id,
                Ok(None) => continue,
                Err(e) => {
                    warn!(handle = %event.handle, error = %e, "Failed to look up file for node event");
                    continue;
                }
            };

            let result = match event.event_type {
                NodeEventType::Removed => self.mark_removed(id, false),
                NodeEventType::Added | NodeEventType::Modified => self.info(id).and_then(|info| {
                    if info.reported_size != event.size || info.modified != event.modified {
                        self.mark_removed(id, true)
                    } else {
                        Ok(())
                    }
                }),
                NodeEventType::Moved => self.relocate(id, FileLocation::new(event.parent, event.name.as_str())),
                NodeEventType::Permissions => Ok(()),
            };
            if let Err(e) = result {
                warn!(%id, event = ?event.event_type, error = %e, "Failed to apply node event");
            }
        }
    }

    fn mark_removed(&self, id: FileID, replaced: bool) -> FileServiceResult<()> {
        self.context.persist(|tx| queries::mark_removed(tx, id))?;
        debug!(%id, replaced, "File removed remotely");
        if let Some(info) = self.context.live_info(id) {
            info.removed(replaced);
        }
        Ok(())
    }

    /// Records where a file lives remotely, or where it will be uploaded
    /// to if it is not bound yet.
    pub fn relocate(&self, id: FileID, location: FileLocation) -> FileServiceResult<()> {
        self.context.persist(|tx| queries::update_location(tx, id, &location))?;
        if let Some(info) = self.context.live_info(id) {
            info.set_location(location);
        }
        Ok(())
    }

    fn schedule_reclaim(&self, delay: Duration) {
        let mut slot = self.reclaim_task.lock();
        if let Some(task) = slot.take() {
            task.cancel();
        }
        if !self.context.options().reclaim_enabled() {
            return;
        }

        let service = self.this.clone();
        *slot = Some(self.context.executor.execute_after(
            move |task| {
                if task.cancelled() {
                    return;
                }
                let Some(service) = service.upgrade() else {
                    return;
                };
                let period = service.options().reclaim_period;
                let weak = Arc::downgrade(&service);
                service.reclaim(Completion::new(move |result| {
                    match result {
                        Ok(reclaimed) => info!(reclaimed, "Periodic reclaim finished"),
                        Err(e) => warn!(error = %e, "Periodic reclaim failed"),
                    }
                    if let Some(service) = weak.upgrade() {
                        service.schedule_reclaim(period);
                    }
                }));
            },
            delay,
        ));
    }
}

impl NodeEventObserver for FileService {
    fn updated(&self, events: &NodeEventQueue) {
        self.apply(events);
    }
}

impl Drop for FileService {
    fn drop(&mut self) {
        if let Some(task) = self.reclaim_task.get_mut().take() {
            task.cancel();
        }
        if let Some(id) = self.observer.get_mut().take() {
            self.context.client.remove_event_observer(id);
        }
    }
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("storage", &self.context.storage)
            .field("open", &self.context.files.len())
            .finish_non_exhaustive()
    }
}

struct Tally {
    remaining: usize,
    reclaimed: u64,
    completion: Option<Completion<u64, FileError>>,
}

impl Tally {
    fn settle(tally: &Mutex<Tally>, reclaimed: u64) {
        let finished = {
            let mut tally = tally.lock();
            tally.remaining -= 1;
            tally.reclaimed += reclaimed;
            if tally.remaining == 0 {
                tally.completion.take().map(|completion| (completion, tally.reclaimed))
            } else {
                None
            }
        };
        if let Some((completion, reclaimed)) = finished {
            completion.succeed(reclaimed);
        }
    }
}

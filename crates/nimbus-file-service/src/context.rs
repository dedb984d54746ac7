//! Per-file request processing.
//!
//! A [`FileContext`] owns the local storage of one file and the tree of byte
//! ranges present in it. Every request passes through the file's
//! [`RequestQueue`]: reads and fetches share the file, everything else
//! holds it exclusively. Admitted requests run on the service's
//! executor; the gate is released when the request's completion fires.
//!
//! Missing content is fetched by range downloads. A download is
//! registered in the in-flight tree before it starts, so concurrent requests
//! needing the same bytes wait on it instead of fetching them again.

use bytes::Bytes;
use nimbus_core::{
    BindHandle, ClientError, Completion, DatabaseResult, FileID, NodeHandle, PartialDownload,
    Task, Transaction,
};
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tracing::{debug, instrument, trace, warn};

use crate::error::{FileError, FileResult};
use crate::event::{FileEventObserver, FileEventObserverID};
use crate::info::{FileInfo, FileInfoContext, now};
use crate::queries;
use crate::range::FileRange;
use crate::range_tree::FileRangeTree;
use crate::rw_state::{GatedRequest, RequestKind, RequestQueue};
use crate::service::ServiceContext;

type Done = Box<dyn FnOnce(FileResult<()>) + Send>;

enum Request {
    Read {
        range: FileRange,
        completion: Completion<Bytes, FileError>,
    },
    Fetch {
        completion: Completion<(), FileError>,
    },
    Flush {
        bind_handle: BindHandle,
        completion: Completion<NodeHandle, FileError>,
    },
    Write {
        offset: u64,
        data: Bytes,
        completion: Completion<(), FileError>,
    },
    Append {
        data: Bytes,
        completion: Completion<u64, FileError>,
    },
    Truncate {
        size: u64,
        completion: Completion<(), FileError>,
    },
    Touch {
        modified: i64,
        completion: Completion<(), FileError>,
    },
    Remove {
        completion: Completion<(), FileError>,
    },
    Reclaim {
        completion: Completion<u64, FileError>,
    },
}

impl GatedRequest for Request {
    fn kind(&self) -> RequestKind {
        match self {
            Request::Read { .. } | Request::Fetch { .. } => RequestKind::Read,
            // Exclusive, so a queued flush sees the file clean once the first uploads.
            Request::Flush { .. }
            | Request::Write { .. }
            | Request::Append { .. }
            | Request::Truncate { .. }
            | Request::Touch { .. }
            | Request::Remove { .. }
            | Request::Reclaim { .. } => RequestKind::Write,
        }
    }
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Read { .. } => "read",
            Request::Fetch { .. } => "fetch",
            Request::Flush { .. } => "flush",
            Request::Write { .. } => "write",
            Request::Append { .. } => "append",
            Request::Truncate { .. } => "truncate",
            Request::Touch { .. } => "touch",
            Request::Remove { .. } => "remove",
            Request::Reclaim { .. } => "reclaim",
        }
    }

    /// Whether the request changes the file's content or attributes.
    fn mutates(&self) -> bool {
        matches!(
            self,
            Request::Write { .. } | Request::Append { .. } | Request::Truncate { .. } | Request::Touch { .. }
        )
    }

    fn fail(self, error: FileError) {
        match self {
            Request::Read { completion, .. } => completion.fail(error),
            Request::Flush { completion, .. } => completion.fail(error),
            Request::Append { completion, .. } | Request::Reclaim { completion } => completion.fail(error),
            Request::Fetch { completion }
            | Request::Write { completion, .. }
            | Request::Truncate { completion, .. }
            | Request::Touch { completion, .. }
            | Request::Remove { completion } => completion.fail(error),
        }
    }

    /// Rewires the request's completion to release the gate after it fires.
    fn gated(self, context: &Arc<FileContext>) -> Self {
        let kind = self.kind();
        match self {
            Request::Read { range, completion } => Request::Read {
                range,
                completion: context.gate(kind, completion),
            },
            Request::Fetch { completion } => Request::Fetch {
                completion: context.gate(kind, completion),
            },
            Request::Flush {
                bind_handle,
                completion,
            } => Request::Flush {
                bind_handle,
                completion: context.gate(kind, completion),
            },
            Request::Write {
                offset,
                data,
                completion,
            } => Request::Write {
                offset,
                data,
                completion: context.gate(kind, completion),
            },
            Request::Append { data, completion } => Request::Append {
                data,
                completion: context.gate(kind, completion),
            },
            Request::Truncate { size, completion } => Request::Truncate {
                size,
                completion: context.gate(kind, completion),
            },
            Request::Touch {
                modified,
                completion,
            } => Request::Touch {
                modified,
                completion: context.gate(kind, completion),
            },
            Request::Remove { completion } => Request::Remove {
                completion: context.gate(kind, completion),
            },
            Request::Reclaim { completion } => Request::Reclaim {
                completion: context.gate(kind, completion),
            },
        }
    }
}

/// Counts outstanding downloads for one request and reports once all finish.
struct Join {
    remaining: AtomicUsize,
    error: Mutex<Option<FileError>>,
    done: Mutex<Option<Done>>,
}

impl Join {
    /// The join starts with one token, released by the final [`finish`](Self::finish).
    fn new(done: Done) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(1),
            error: Mutex::new(None),
            done: Mutex::new(Some(done)),
        })
    }

    fn waiter(self: &Arc<Self>) -> Completion<(), FileError> {
        self.remaining.fetch_add(1, Ordering::AcqRel);
        let join = Arc::clone(self);
        Completion::new(move |result| join.finish(result))
    }

    fn finish(&self, result: FileResult<()>) {
        if let Err(e) = result {
            self.error.lock().get_or_insert(e);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let result = self.error.lock().take().map_or(Ok(()), Err);
            if let Some(done) = self.done.lock().take() {
                done(result);
            }
        }
    }
}

/// A download of one hole in the file.
struct RangeDownload {
    range: FileRange,
    waiters: Mutex<Vec<Completion<(), FileError>>>,
    partial: Mutex<Option<Arc<dyn PartialDownload>>>,
    cancelled: AtomicBool,
    retries: AtomicU32,
}

impl RangeDownload {
    fn new(range: FileRange, waiter: Completion<(), FileError>) -> Self {
        Self {
            range,
            waiters: Mutex::new(vec![waiter]),
            partial: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            retries: AtomicU32::new(0),
        }
    }

    fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(partial) = self.partial.lock().as_ref() {
            partial.cancel();
        }
    }
}

struct FileState {
    /// Bytes present in local storage.
    ranges: FileRangeTree,
    /// Downloads in flight, keyed by the hole they fill.
    downloads: FileRangeTree<Arc<RangeDownload>>,
}

/// An open file.
///
/// All operations are asynchronous and report through a [`Completion`]
/// exactly once.
pub struct FileContext {
    info: Arc<FileInfoContext>,
    service: Arc<ServiceContext>,
    storage: File,
    state: Mutex<FileState>,
    queue: RequestQueue<Request>,
    read_only: bool,
}

impl FileContext {
    pub(crate) fn new(
        info: Arc<FileInfoContext>,
        service: Arc<ServiceContext>,
        storage: File,
        ranges: FileRangeTree,
        read_only: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            info,
            service,
            storage,
            state: Mutex::new(FileState {
                ranges,
                downloads: FileRangeTree::new(0),
            }),
            queue: RequestQueue::new(),
            read_only,
        })
    }

    pub fn id(&self) -> FileID {
        self.info.id()
    }

    /// A snapshot of the file's attributes.
    pub fn info(&self) -> FileInfo {
        self.info.snapshot()
    }

    /// The shared attribute context.
    pub fn info_context(&self) -> Arc<FileInfoContext> {
        Arc::clone(&self.info)
    }

    /// Byte ranges present in local storage.
    pub fn ranges(&self) -> Vec<FileRange> {
        self.state.lock().ranges.ranges()
    }

    /// Whether the remote node denies modification.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Number of requests waiting for the gate.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn add_observer(&self, observer: FileEventObserver) -> FileEventObserverID {
        self.info.add_observer(observer)
    }

    pub fn remove_observer(&self, id: FileEventObserverID) -> bool {
        self.info.remove_observer(id)
    }

    /// Reads `range`, clamped to the file's size.
    #[instrument(level = "trace", name = "file::read", skip_all, fields(id = %self.id(), %range))]
    pub fn read(self: &Arc<Self>, range: FileRange, completion: Completion<Bytes, FileError>) {
        self.submit(Request::Read { range, completion });
    }

    /// Writes `data` at `offset`. Writing past the end zero-fills the gap.
    #[instrument(level = "trace", name = "file::write", skip_all, fields(id = %self.id(), offset, len = data.len()))]
    pub fn write(self: &Arc<Self>, offset: u64, data: Bytes, completion: Completion<(), FileError>) {
        self.submit(Request::Write {
            offset,
            data,
            completion,
        });
    }

    /// Writes `data` at the end of the file and reports the offset it landed at.
    pub fn append(self: &Arc<Self>, data: Bytes, completion: Completion<u64, FileError>) {
        self.submit(Request::Append { data, completion });
    }

    pub fn truncate(self: &Arc<Self>, size: u64, completion: Completion<(), FileError>) {
        self.submit(Request::Truncate { size, completion });
    }

    /// Sets the modification time.
    pub fn touch(self: &Arc<Self>, modified: i64, completion: Completion<(), FileError>) {
        self.submit(Request::Touch {
            modified,
            completion,
        });
    }

    /// Makes the whole file resident.
    pub fn fetch(self: &Arc<Self>, completion: Completion<(), FileError>) {
        self.submit(Request::Fetch { completion });
    }

    /// Uploads local changes and reports the node the file is bound to.
    ///
    /// A clean, bound file completes immediately with its handle.
    pub fn flush(self: &Arc<Self>, bind_handle: BindHandle, completion: Completion<NodeHandle, FileError>) {
        self.submit(Request::Flush {
            bind_handle,
            completion,
        });
    }

    /// Removes the file, and its node if it is bound.
    pub fn remove(self: &Arc<Self>, completion: Completion<(), FileError>) {
        self.submit(Request::Remove { completion });
    }

    /// Discards the local content of a clean file and reports how many
    /// bytes were released. Dirty files are left alone.
    pub fn reclaim(self: &Arc<Self>, completion: Completion<u64, FileError>) {
        let request = Request::Reclaim { completion };
        if let Some(request) = self.queue.submit_first(request) {
            self.dispatch(request);
        }
    }

    /// Cancels in-flight downloads and every queued request.
    ///
    /// Requests waiting on a download complete with [`FileError::Cancelled`].
    pub fn cancel(&self) {
        let downloads: Vec<Arc<RangeDownload>> = self
            .state
            .lock()
            .downloads
            .iter()
            .map(|(_, download)| Arc::clone(download))
            .collect();
        for download in &downloads {
            download.cancel();
        }
        let queued = self.queue.take_all();
        debug!(
            id = %self.id(),
            downloads = downloads.len(),
            queued = queued.len(),
            "Cancelling file requests"
        );
        drop(queued);
    }

    fn submit(self: &Arc<Self>, request: Request) {
        trace!(id = %self.id(), request = request.name(), "Request submitted");
        if let Some(request) = self.queue.submit(request) {
            self.dispatch(request);
        }
    }

    fn dispatch(self: &Arc<Self>, request: Request) {
        let request = request.gated(self);
        let this = Arc::clone(self);
        self.service.executor.execute(move |task| this.run(task, request));
    }

    fn gate<T: 'static>(self: &Arc<Self>, kind: RequestKind, completion: Completion<T, FileError>) -> Completion<T, FileError> {
        let this = Arc::clone(self);
        Completion::new(move |result| {
            completion.complete(result);
            this.release(kind);
        })
    }

    fn release(self: &Arc<Self>, kind: RequestKind) {
        for request in self.queue.completed(kind) {
            self.dispatch(request);
        }
    }

    fn run(self: &Arc<Self>, task: &Task, request: Request) {
        if task.cancelled() {
            request.fail(FileError::Cancelled);
            return;
        }
        if self.info.is_removed() && !matches!(request, Request::Remove { .. } | Request::Reclaim { .. }) {
            request.fail(FileError::Removed);
            return;
        }
        if self.read_only && request.mutates() {
            request.fail(FileError::ReadOnly);
            return;
        }

        match request {
            Request::Read { range, completion } => self.read_range(range, completion),
            Request::Fetch { completion } => {
                let whole = FileRange::new(0, self.info.size());
                self.ensure_resident(vec![whole], Box::new(move |result| completion.complete(result)));
            }
            Request::Flush {
                bind_handle,
                completion,
            } => self.flush_file(bind_handle, completion),
            Request::Write {
                offset,
                data,
                completion,
            } => self.write_data(offset, data, completion),
            Request::Append { data, completion } => {
                let offset = self.info.size();
                self.write_data(offset, data, completion.map(move |()| offset));
            }
            Request::Truncate { size, completion } => completion.complete(self.truncate_file(size)),
            Request::Touch {
                modified,
                completion,
            } => completion.complete(self.touch_file(modified)),
            Request::Remove { completion } => completion.complete(self.remove_file()),
            Request::Reclaim { completion } => completion.complete(self.reclaim_file()),
        }
    }

    fn read_range(self: &Arc<Self>, range: FileRange, completion: Completion<Bytes, FileError>) {
        let range = range.clamp_end(self.info.size());
        if range.is_empty() {
            completion.succeed(Bytes::new());
            return;
        }

        let plan = {
            let state = self.state.lock();
            if state.ranges.covers(range) {
                Vec::new()
            } else {
                vec![self.plan_fetch(&state.ranges, range)]
            }
        };

        let this = Arc::clone(self);
        self.ensure_resident(
            plan,
            Box::new(move |result| {
                let result = result.and_then(|()| this.read_storage(range));
                if result.is_ok() {
                    this.record_access();
                }
                completion.complete(result);
            }),
        );
    }

    /// Grows a read to the minimum download size and snaps it to resident
    /// neighbours closer than the merge distance.
    fn plan_fetch(&self, ranges: &FileRangeTree, range: FileRange) -> FileRange {
        let options = self.service.options();
        let size = self.info.size();
        let wanted = if range.len() < options.minimum_range_size {
            FileRange::with_length(range.begin(), options.minimum_range_size)
        } else {
            range
        };
        let mut span = wanted.clamp_end(size);

        let distance = options.minimum_range_distance;
        if distance > 0 {
            if let Some((left, _)) = ranges.ends_before(span.begin())
                && span.begin() - left.end() < distance
            {
                span = FileRange::new(left.end(), span.end());
            }
            if let Some((right, _)) = ranges.begins_after(span.end()).next()
                && right.begin() - span.end() < distance
            {
                span = FileRange::new(span.begin(), right.begin());
            }
        }
        span
    }

    /// Holes next to a write that are closer than the merge distance to a
    /// resident neighbour. They are downloaded so the write joins it.
    fn plan_fill(&self, ranges: &FileRangeTree, write: FileRange, size: u64) -> Vec<FileRange> {
        let distance = self.service.options().minimum_range_distance;
        let mut fill = Vec::new();
        if distance == 0 {
            return fill;
        }
        if ranges.find(write.begin().saturating_sub(1)).is_none()
            && let Some((left, _)) = ranges.ends_before(write.begin())
        {
            let gap = FileRange::new(left.end(), write.begin());
            if gap.len() < distance {
                fill.push(gap);
            }
        }
        if ranges.find(write.end()).is_none()
            && let Some((right, _)) = ranges.begins_after(write.end()).next()
        {
            let gap = FileRange::new(write.end(), right.begin()).clamp_end(size);
            if gap.len() < distance {
                fill.push(gap);
            }
        }
        fill.retain(|gap| !gap.is_empty());
        fill
    }

    /// Downloads whatever part of `ranges` is not resident, then calls `done`.
    fn ensure_resident(self: &Arc<Self>, ranges: Vec<FileRange>, done: Done) {
        let join = Join::new(done);
        let mut started = Vec::new();
        {
            let mut state = self.state.lock();
            let gaps: Vec<FileRange> = ranges
                .iter()
                .filter(|range| !range.is_empty())
                .flat_map(|range| state.ranges.gaps(*range))
                .collect();

            if !gaps.is_empty() && self.info.handle().is_undef() {
                drop(state);
                join.finish(Err(FileError::Failed(format!(
                    "file {} has no remote content",
                    self.id()
                ))));
                return;
            }

            for gap in gaps {
                let mut cursor = gap.begin();
                let in_flight: Vec<(FileRange, Arc<RangeDownload>)> = state
                    .downloads
                    .overlapping(gap)
                    .map(|(range, download)| (range, Arc::clone(download)))
                    .collect();
                for (range, download) in in_flight {
                    if range.begin() > cursor {
                        started.push(Self::add_download(&mut state, FileRange::new(cursor, range.begin()), &join));
                    }
                    trace!(id = %self.id(), %range, "Joining download in flight");
                    download.waiters.lock().push(join.waiter());
                    cursor = cursor.max(range.end());
                }
                if cursor < gap.end() {
                    started.push(Self::add_download(&mut state, FileRange::new(cursor, gap.end()), &join));
                }
            }
        }

        for download in started {
            self.start_download(download);
        }
        join.finish(Ok(()));
    }

    fn add_download(state: &mut FileState, range: FileRange, join: &Arc<Join>) -> Arc<RangeDownload> {
        let download = Arc::new(RangeDownload::new(range, join.waiter()));
        let added = state.downloads.try_add(range, Arc::clone(&download));
        debug_assert!(added.is_ok(), "download {range} overlaps one in flight");
        download
    }

    fn start_download(self: &Arc<Self>, download: Arc<RangeDownload>) {
        if download.cancelled() {
            self.finish_download(&download, Err(FileError::Cancelled));
            return;
        }

        let range = download.range;
        trace!(
            id = %self.id(),
            %range,
            retries = download.retries.load(Ordering::Relaxed),
            "Downloading range"
        );
        let this = Arc::clone(self);
        let pending = Arc::clone(&download);
        let partial = self.service.client.download(
            self.info.handle(),
            range.begin(),
            range.len(),
            Completion::new(move |result| this.downloaded(pending, result)),
        );

        *download.partial.lock() = Some(Arc::clone(&partial));
        if download.cancelled() {
            partial.cancel();
        }
    }

    fn downloaded(self: &Arc<Self>, download: Arc<RangeDownload>, result: Result<Vec<u8>, ClientError>) {
        let error = match result {
            Ok(bytes) => {
                let result = self.store_download(&download, &bytes);
                self.finish_download(&download, result);
                return;
            }
            Err(error) => error,
        };

        let options = self.service.options();
        if error.is_retryable() && !download.cancelled() {
            let retries = download.retries.fetch_add(1, Ordering::AcqRel) + 1;
            if retries <= options.maximum_range_retries {
                warn!(
                    id = %self.id(),
                    range = %download.range,
                    retries,
                    error = %error,
                    "Range download failed, retrying"
                );
                let this = Arc::clone(self);
                self.service.executor.execute_after(
                    move |task| {
                        if task.cancelled() {
                            download.cancel();
                        }
                        this.start_download(download);
                    },
                    options.range_retry_backoff,
                );
                return;
            }
        }

        if !error.is_cancelled() {
            warn!(id = %self.id(), range = %download.range, error = %error, "Range download failed");
        }
        self.finish_download(&download, Err(error.into()));
    }

    fn store_download(&self, download: &RangeDownload, bytes: &[u8]) -> FileResult<()> {
        if download.cancelled() {
            return Err(FileError::Cancelled);
        }
        let range = download.range;
        if (bytes.len() as u64) < range.len() {
            return Err(FileError::Failed(format!(
                "short download of {range}: received {} bytes",
                bytes.len()
            )));
        }
        let length = usize::try_from(range.len())
            .map_err(|_| FileError::InvalidArguments(format!("range {range} is too large")))?;
        self.storage.write_all_at(&bytes[..length], range.begin())?;
        self.update_ranges(|ranges| ranges.insert(range).ok(), |_, _| Ok(()))?;
        Ok(())
    }

    fn finish_download(&self, download: &Arc<RangeDownload>, result: FileResult<()>) {
        let waiters = {
            let mut state = self.state.lock();
            let current = state
                .downloads
                .find(download.range.begin())
                .is_some_and(|(_, d)| Arc::ptr_eq(d, download));
            if current {
                state.downloads.remove(download.range);
            }
            std::mem::take(&mut *download.waiters.lock())
        };
        for waiter in waiters {
            waiter.complete(result.clone());
        }
    }

    /// Applies `change` to a copy of the resident ranges, persists the span
    /// it reports together with `also`, and installs the copy once the
    /// transaction commits.
    ///
    /// Returns the number of resident bytes afterwards.
    fn update_ranges<C, A>(&self, change: C, also: A) -> FileResult<u64>
    where
        C: FnOnce(&mut FileRangeTree) -> Option<FileRange>,
        A: FnOnce(&Transaction<'_>, u64) -> DatabaseResult<()>,
    {
        let id = self.id();
        let mut state = self.state.lock();
        let mut ranges = state.ranges.clone();
        let span = change(&mut ranges);
        let allocated = ranges.total_len();
        self.service.persist(|tx| {
            if let Some(span) = span {
                queries::sync_ranges(tx, id, &ranges, span)?;
            }
            queries::set_allocated_size(tx, id, allocated)?;
            also(tx, allocated)
        })?;
        state.ranges = ranges;
        drop(state);
        self.info.set_allocated_size(allocated);
        Ok(allocated)
    }

    fn read_storage(&self, range: FileRange) -> FileResult<Bytes> {
        let length = usize::try_from(range.len())
            .map_err(|_| FileError::InvalidArguments(format!("range {range} is too large")))?;
        let mut buffer = vec![0u8; length];
        let mut filled = 0;
        while filled < length {
            let read = self
                .storage
                .read_at(&mut buffer[filled..], range.begin() + filled as u64)?;
            if read == 0 {
                // Past the end of storage; the rest reads as zeroes.
                break;
            }
            filled += read;
        }
        Ok(Bytes::from(buffer))
    }

    fn record_access(&self) {
        let accessed = now();
        self.info.accessed(accessed);
        let id = self.id();
        if let Err(e) = self.service.persist(|tx| queries::set_accessed(tx, id, accessed)) {
            warn!(%id, error = %e, "Failed to record access time");
        }
    }

    fn write_data(self: &Arc<Self>, offset: u64, data: Bytes, completion: Completion<(), FileError>) {
        if data.is_empty() {
            completion.succeed(());
            return;
        }
        let Some(end) = offset.checked_add(data.len() as u64) else {
            completion.fail(FileError::InvalidArguments(format!(
                "write of {} bytes at {offset} overflows",
                data.len()
            )));
            return;
        };

        let size = self.info.size();
        let write = FileRange::new(offset.min(size), end);
        let fill = {
            let state = self.state.lock();
            self.plan_fill(&state.ranges, write, size)
        };

        let this = Arc::clone(self);
        self.ensure_resident(
            fill,
            Box::new(move |result| {
                completion.complete(result.and_then(|()| this.store_write(offset, &data, write)));
            }),
        );
    }

    fn store_write(&self, offset: u64, data: &[u8], write: FileRange) -> FileResult<()> {
        self.storage.write_all_at(data, offset)?;

        let modified = now();
        let mut info = self.info.snapshot();
        info.size = info.size.max(write.end());
        info.modified = modified;
        info.accessed = info.accessed.max(modified);
        info.dirty = true;
        self.update_ranges(
            |ranges| ranges.insert(write).ok(),
            move |tx, allocated| {
                info.allocated_size = allocated;
                queries::update_file(tx, &info)
            },
        )?;
        self.info.written(modified, write);
        Ok(())
    }

    fn truncate_file(&self, size: u64) -> FileResult<()> {
        let old = self.info.size();
        let modified = now();
        if size > old {
            self.storage.set_len(size)?;
        }

        let mut info = self.info.snapshot();
        info.size = size;
        info.modified = modified;
        info.accessed = info.accessed.max(modified);
        info.dirty = true;
        self.update_ranges(
            |ranges| {
                if size < old {
                    ranges.truncate(size);
                    Some(FileRange::new(size, old))
                } else if size > old {
                    ranges.insert(FileRange::new(old, size)).ok()
                } else {
                    None
                }
            },
            move |tx, allocated| {
                info.allocated_size = allocated;
                queries::update_file(tx, &info)
            },
        )?;
        if size < old {
            self.storage.set_len(size)?;
        }

        debug!(id = %self.id(), old, size, "File truncated");
        self.info.truncated(modified, size);
        Ok(())
    }

    fn touch_file(&self, modified: i64) -> FileResult<()> {
        let accessed = now();
        let mut info = self.info.snapshot();
        info.modified = modified;
        info.accessed = info.accessed.max(accessed);
        info.dirty = true;
        self.service.persist(|tx| queries::update_file(tx, &info))?;
        self.info.modified(accessed, modified);
        Ok(())
    }

    fn flush_file(self: &Arc<Self>, bind_handle: BindHandle, completion: Completion<NodeHandle, FileError>) {
        let handle = self.info.handle();
        if !self.info.dirty() && !handle.is_undef() {
            completion.succeed(handle);
            return;
        }

        let whole = FileRange::new(0, self.info.size());
        let this = Arc::clone(self);
        self.ensure_resident(
            vec![whole],
            Box::new(move |result| match result.and_then(|()| this.read_storage(whole)) {
                Ok(content) => this.upload(content, &bind_handle, completion),
                Err(e) => completion.fail(e),
            }),
        );
    }

    fn upload(self: &Arc<Self>, content: Bytes, bind_handle: &BindHandle, completion: Completion<NodeHandle, FileError>) {
        let location = self.info.location();
        if location.parent.is_undef() {
            completion.fail(FileError::InvalidArguments(format!(
                "file {} has no parent",
                self.id()
            )));
            return;
        }

        let id = self.id();
        let size = content.len() as u64;
        // The echoed node event is recognized by its bind handle.
        let bind_handle = if bind_handle.is_empty() {
            BindHandle::generate()
        } else {
            bind_handle.clone()
        };
        debug!(%id, parent = %location.parent, name = %location.name, size, "Uploading file");
        self.service.uploads.insert(bind_handle.clone(), id);

        let this = Arc::clone(self);
        let bind = bind_handle.clone();
        self.service.client.upload(
            content.to_vec(),
            location.parent,
            &location.name,
            &bind_handle,
            Completion::new(move |result: Result<NodeHandle, ClientError>| {
                let result = result
                    .map_err(FileError::from)
                    .and_then(|handle| this.flushed(handle, size).map(|()| handle));
                this.service.uploads.remove(&bind);
                completion.complete(result);
            }),
        );
    }

    fn flushed(&self, handle: NodeHandle, size: u64) -> FileResult<()> {
        let id = self.id();
        let mut info = self.info.snapshot();
        info.handle = handle;
        info.dirty = false;
        info.reported_size = size;
        if let Ok(node) = self.service.client.get(handle) {
            info.modified = node.modified;
        }

        let mut replaced = Vec::new();
        self.service.persist(|tx| {
            replaced = queries::take_handle(tx, id, handle)?;
            queries::update_file(tx, &info)
        })?;
        for other in replaced {
            self.service.replaced(other);
        }

        debug!(%id, %handle, size, "File flushed");
        self.info.flushed(handle, info.modified);
        Ok(())
    }

    /// Local state is marked removed before the node is, so the removal
    /// echoed back by the client finds nothing left to do.
    fn remove_file(&self) -> FileResult<()> {
        if self.info.is_removed() {
            return Ok(());
        }
        let id = self.id();
        let handle = self.info.handle();
        self.service.persist(|tx| queries::mark_removed(tx, id))?;
        self.info.removed(false);

        if !handle.is_undef() {
            match self.service.client.remove(handle) {
                Ok(()) | Err(ClientError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(%id, %handle, "File removed");
        Ok(())
    }

    fn reclaim_file(&self) -> FileResult<u64> {
        if self.info.dirty() {
            trace!(id = %self.id(), "Skipping reclaim of dirty file");
            return Ok(0);
        }
        let id = self.id();
        let previous = self.state.lock().ranges.total_len();
        if previous == 0 {
            return Ok(0);
        }

        self.update_ranges(
            |ranges| {
                ranges.clear();
                None
            },
            |tx, _| queries::clear_ranges(tx, id),
        )?;
        self.storage.set_len(0)?;
        debug!(%id, reclaimed = previous, "File content reclaimed");
        Ok(previous)
    }
}

impl Drop for FileContext {
    fn drop(&mut self) {
        let id = self.info.id();
        self.service
            .files
            .remove_if(&id, |_, context| context.strong_count() == 0);
    }
}

impl std::fmt::Debug for FileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileContext")
            .field("id", &self.id())
            .field("read_only", &self.read_only)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

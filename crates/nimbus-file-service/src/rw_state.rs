//! Per-file reader/writer gate.
//!
//! [`FileReadWriteState`] is a single signed counter: `0` when idle, `-n`
//! while `n` readers are active and `1` while one writer is active.
//! Transitions never block; a request that cannot start is parked in a
//! [`RequestQueue`] and started when an active request completes.
//!
//! Queued requests form one FIFO. A read may start immediately only when
//! no write is queued, so a writer waiting behind active readers is served
//! before any read that arrives after it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::trace;

/// Signed reader/writer counter.
#[derive(Debug, Default)]
pub struct FileReadWriteState {
    state: AtomicI64,
}

impl FileReadWriteState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to admit a reader.
    pub fn read(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state <= 0).then(|| state - 1)
            })
            .is_ok()
    }

    /// Releases a reader.
    pub fn read_completed(&self) {
        let previous = self.state.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous < 0, "read completed while state was {previous}");
    }

    /// Tries to admit the writer.
    pub fn write(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the writer.
    pub fn write_completed(&self) {
        let previous = self.state.swap(0, Ordering::AcqRel);
        debug_assert_eq!(previous, 1, "write completed while state was {previous}");
    }

    /// Current counter value.
    pub fn value(&self) -> i64 {
        self.state.load(Ordering::Acquire)
    }

    /// Number of active readers.
    pub fn readers(&self) -> u64 {
        u64::try_from(-self.value().min(0)).unwrap_or(0)
    }

    /// Whether the writer is active.
    pub fn writing(&self) -> bool {
        self.value() == 1
    }

    pub fn idle(&self) -> bool {
        self.value() == 0
    }
}

/// Which side of the gate a request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
}

/// A request that knows which side of the gate it needs.
pub trait GatedRequest {
    fn kind(&self) -> RequestKind;
}

struct Queue<R> {
    requests: VecDeque<R>,
    pending_writes: usize,
}

/// FIFO of requests waiting on a [`FileReadWriteState`].
pub struct RequestQueue<R> {
    state: FileReadWriteState,
    queue: Mutex<Queue<R>>,
}

impl<R> Default for RequestQueue<R> {
    fn default() -> Self {
        Self {
            state: FileReadWriteState::new(),
            queue: Mutex::new(Queue {
                requests: VecDeque::new(),
                pending_writes: 0,
            }),
        }
    }
}

impl<R: GatedRequest> RequestQueue<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying gate.
    pub fn state(&self) -> &FileReadWriteState {
        &self.state
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.queue.lock().requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().requests.is_empty()
    }

    /// Number of queued writes.
    pub fn pending_writes(&self) -> usize {
        self.queue.lock().pending_writes
    }

    fn admissible(&self, queue: &Queue<R>, kind: RequestKind, queuing: bool) -> bool {
        match kind {
            RequestKind::Read => !(queuing && queue.pending_writes > 0) && self.state.read(),
            RequestKind::Write => self.state.write(),
        }
    }

    /// Admits `request` if the gate allows it, returning it to the caller to
    /// run. Otherwise queues it and returns `None`.
    pub fn submit(&self, request: R) -> Option<R> {
        let mut queue = self.queue.lock();
        let kind = request.kind();
        if self.admissible(&queue, kind, true) {
            return Some(request);
        }
        if kind == RequestKind::Write {
            queue.pending_writes += 1;
        }
        queue.requests.push_back(request);
        trace!(?kind, queued = queue.requests.len(), "Request queued");
        None
    }

    /// Queues `request` ahead of everything else.
    pub fn submit_first(&self, request: R) -> Option<R> {
        let mut queue = self.queue.lock();
        let kind = request.kind();
        if queue.requests.is_empty() && self.admissible(&queue, kind, false) {
            return Some(request);
        }
        if kind == RequestKind::Write {
            queue.pending_writes += 1;
        }
        queue.requests.push_front(request);
        None
    }

    /// Releases the gate held by a request of `kind` and returns the queued
    /// requests that may now run, in order.
    pub fn completed(&self, kind: RequestKind) -> Vec<R> {
        match kind {
            RequestKind::Read => self.state.read_completed(),
            RequestKind::Write => self.state.write_completed(),
        }
        self.drain()
    }

    /// Pops requests off the front of the queue while the gate admits them.
    pub fn drain(&self) -> Vec<R> {
        let mut queue = self.queue.lock();
        let mut admitted = Vec::new();
        while let Some(front) = queue.requests.front() {
            let kind = front.kind();
            if !self.admissible(&queue, kind, false) {
                break;
            }
            if kind == RequestKind::Write {
                queue.pending_writes -= 1;
            }
            if let Some(request) = queue.requests.pop_front() {
                admitted.push(request);
            }
        }
        admitted
    }

    /// Removes every queued request.
    pub fn take_all(&self) -> Vec<R> {
        let mut queue = self.queue.lock();
        queue.pending_writes = 0;
        queue.requests.drain(..).collect()
    }
}

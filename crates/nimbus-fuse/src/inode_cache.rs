//! Keeps recently used inodes in memory.
//!
//! The cache holds a reference to each inode it contains, so a cached inode
//! stays materialized after everyone else has released it. Entries are
//! ordered by last use. Adding past `max_size` evicts the oldest entry at
//! once; a cleaner thread periodically trims the cache to
//! `clean_size_threshold` entries and drops anything older than
//! `clean_age_threshold`.
//!
//! Evicted references are handed back to the caller instead of being
//! dropped in place: releasing the last reference to an inode calls back
//! into the registry, which must not happen while the registry is locked.

use nimbus_core::InodeID;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{Span, debug, trace};

use crate::config::InodeCacheFlags;
use crate::inode::InodeRef;

const MIN_CLEAN_INTERVAL: Duration = Duration::from_millis(10);

struct Entry {
    accessed: Instant,
    inode: InodeRef,
}

struct CacheState {
    flags: InodeCacheFlags,
    // Keyed by a sequence number: the first entry is the least recently used.
    entries: BTreeMap<u64, Entry>,
    positions: HashMap<InodeID, u64>,
    next: u64,
    terminate: bool,
}

impl CacheState {
    fn take(&mut self, id: InodeID) -> Option<Entry> {
        let position = self.positions.remove(&id)?;
        self.entries.remove(&position)
    }

    fn pop_oldest(&mut self) -> Option<Entry> {
        let (_, entry) = self.entries.pop_first()?;
        self.positions.remove(&entry.inode.id());
        Some(entry)
    }

    fn trim_to(&mut self, size: usize, evicted: &mut Vec<InodeRef>) {
        while self.entries.len() > size {
            match self.pop_oldest() {
                Some(entry) => evicted.push(entry.inode),
                None => break,
            }
        }
    }

    fn reduce(&mut self, now: Instant) -> Vec<InodeRef> {
        let mut evicted = Vec::new();
        let size = self.flags.clean_size_threshold;
        let age = self.flags.clean_age_threshold;
        while let Some((_, oldest)) = self.entries.first_key_value() {
            let expired = now.saturating_duration_since(oldest.accessed) >= age;
            if self.entries.len() <= size && !expired {
                break;
            }
            if let Some(entry) = self.pop_oldest() {
                evicted.push(entry.inode);
            }
        }
        evicted
    }
}

struct Shared {
    state: Mutex<CacheState>,
    wake: Condvar,
    span: Span,
}

pub(crate) struct InodeCache {
    shared: Arc<Shared>,
    cleaner: Option<JoinHandle<()>>,
}

impl InodeCache {
    pub(crate) fn new(flags: InodeCacheFlags, span: Span) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState {
                flags,
                entries: BTreeMap::new(),
                positions: HashMap::new(),
                next: 0,
                terminate: false,
            }),
            wake: Condvar::new(),
            span,
        });

        let cleaner = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("inode-cache".to_string())
                .spawn(move || clean_loop(&shared))
                .expect("failed to spawn inode cache thread")
        };

        Self {
            shared,
            cleaner: Some(cleaner),
        }
    }

    /// Adds `inode` as the most recently used entry. Returns references the
    /// caller must drop once it holds no locks.
    pub(crate) fn add(&self, inode: InodeRef) -> Vec<InodeRef> {
        let mut evicted = Vec::new();
        let mut state = self.shared.state.lock();
        let id = inode.id();
        if let Some(previous) = state.take(id) {
            evicted.push(previous.inode);
        } else {
            trace!(parent: &self.shared.span, %id, "Inode cached");
        }

        let position = state.next;
        state.next += 1;
        state.positions.insert(id, position);
        state.entries.insert(
            position,
            Entry {
                accessed: Instant::now(),
                inode,
            },
        );

        let max_size = state.flags.max_size;
        state.trim_to(max_size, &mut evicted);
        evicted
    }

    pub(crate) fn remove(&self, id: InodeID) -> Option<InodeRef> {
        self.shared.state.lock().take(id).map(|entry| entry.inode)
    }

    pub(crate) fn contains(&self, id: InodeID) -> bool {
        self.shared.state.lock().positions.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub(crate) fn clear(&self) -> Vec<InodeRef> {
        let mut state = self.shared.state.lock();
        state.positions.clear();
        std::mem::take(&mut state.entries)
            .into_values()
            .map(|entry| entry.inode)
            .collect()
    }

    /// Runs one cleaner pass now.
    pub(crate) fn clean(&self) -> Vec<InodeRef> {
        self.shared.state.lock().reduce(Instant::now())
    }

    pub(crate) fn flags(&self) -> InodeCacheFlags {
        self.shared.state.lock().flags.clone()
    }

    pub(crate) fn set_flags(&self, flags: InodeCacheFlags) -> Vec<InodeRef> {
        let mut evicted = Vec::new();
        {
            let mut state = self.shared.state.lock();
            state.flags = flags;
            let max_size = state.flags.max_size;
            state.trim_to(max_size, &mut evicted);
        }
        self.shared.wake.notify_one();
        evicted
    }
}

impl Drop for InodeCache {
    fn drop(&mut self) {
        self.shared.state.lock().terminate = true;
        self.shared.wake.notify_one();
        if let Some(cleaner) = self.cleaner.take()
            && cleaner.thread().id() != thread::current().id()
        {
            let _ = cleaner.join();
        }
        drop(self.clear());
    }
}

fn clean_loop(shared: &Shared) {
    let _entered = shared.span.enter();
    debug!("Inode cache cleaner started");

    loop {
        let evicted = {
            let mut state = shared.state.lock();
            if state.terminate {
                break;
            }
            let interval = state.flags.clean_interval.max(MIN_CLEAN_INTERVAL);
            shared.wake.wait_for(&mut state, interval);
            if state.terminate {
                break;
            }
            state.reduce(Instant::now())
        };
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Inode cache cleaned");
        }
    }

    debug!("Inode cache cleaner stopped");
}

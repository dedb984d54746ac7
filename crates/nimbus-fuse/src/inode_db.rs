//! The registry owning every inode in memory.
//!
//! Inodes are materialized on demand from the remote tree and indexed by
//! [`InodeID`]. Handle-derived IDs can always be rebuilt from the client;
//! files created locally get a synthetic ID and stay pinned in memory until
//! an upload binds them to a node.
//!
//! # Lifetime
//!
//! Every holder of an inode holds an [`InodeRef`]: mount contexts, the
//! cache, the pin of an unbound file, and each child (for its parent). When
//! the last reference goes the inode is dropped from the registry, so a
//! directory outlives all of its children in memory and eviction proceeds
//! bottom-up. Removed inodes are tombstoned: lookups stop finding them, but
//! they stay in memory until released.
//!
//! # Locking
//!
//! Releasing the last reference re-enters the registry, so references are
//! never dropped while its lock is held. Operations collect the references
//! they give up and drop them after unlocking.

use nimbus_core::{
    AccessLevel, BindHandle, Client, ClientError, Database, InodeID, Migration, NodeEvent,
    NodeEventQueue, NodeEventType, NodeHandle, NodeInfo,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{Span, debug, info_span, instrument, trace, warn};

use crate::config::InodeCacheFlags;
use crate::error::{FuseError, FuseResult};
use crate::inode::{DirectoryInode, FileInode, Inode, InodeInfo, InodeKind, InodeRef};
use crate::inode_cache::InodeCache;
use crate::reference::{Badge, Issuer, Ref};

const COMPONENT: &str = "inode_db";

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "synthetic_inode_ids",
    sql: r"
        CREATE TABLE inode_ids (
            next INTEGER NOT NULL
        );
        INSERT INTO inode_ids (next) VALUES (1);
    ",
}];

/// References given up under the lock, dropped after it is released.
type Released = Vec<InodeRef>;

#[derive(Default)]
struct State {
    inodes: HashMap<InodeID, Arc<Inode>>,
    bindings: HashMap<BindHandle, InodeID>,
    pinned: HashMap<InodeID, InodeRef>,
}

/// Only this module can build one, so only [`InodeDB`] mints its badges.
pub(crate) struct BadgeKey(());

impl Issuer for InodeDB {
    type Key = BadgeKey;
}

/// Owns and indexes the inodes in memory.
pub struct InodeDB {
    client: Arc<dyn Client>,
    database: Arc<Database>,
    state: Mutex<State>,
    cache: InodeCache,
    discard: AtomicBool,
    this: Weak<InodeDB>,
    span: Span,
}

impl InodeDB {
    pub fn new(
        client: Arc<dyn Client>,
        database: Arc<Database>,
        flags: InodeCacheFlags,
    ) -> FuseResult<Arc<Self>> {
        database.migrate(COMPONENT, MIGRATIONS)?;
        let span = info_span!("inode_db");
        Ok(Arc::new_cyclic(|this| Self {
            client,
            database,
            state: Mutex::new(State::default()),
            cache: InodeCache::new(flags, span.clone()),
            discard: AtomicBool::new(false),
            this: this.clone(),
            span,
        }))
    }

    fn badge() -> Badge<InodeDB> {
        Badge::new(BadgeKey(()))
    }

    /// The inode with `id`, materializing it from the client if needed.
    pub fn get(&self, id: InodeID) -> FuseResult<InodeRef> {
        if let Some(inode) = self.existing(id)? {
            return Ok(inode);
        }
        let handle = id.handle().ok_or(FuseError::NotFound)?;
        let node = self.client.get(handle).map_err(not_found)?;
        let parent = if node.parent.is_undef() {
            None
        } else {
            Some(self.get(InodeID::from_handle(node.parent))?)
        };
        Ok(self.materialize(&node, parent))
    }

    /// The directory inode at the root of a mount.
    pub fn root(&self, handle: NodeHandle) -> FuseResult<InodeRef> {
        let root = self.get(InodeID::from_handle(handle))?;
        if !root.is_directory() {
            return Err(FuseError::NotDirectory);
        }
        Ok(root)
    }

    /// The child of `parent` called `name`.
    #[instrument(level = "trace", name = "inode_db::lookup", skip_all, fields(parent = %parent.id(), name = %name))]
    pub fn lookup(&self, parent: &InodeRef, name: &str) -> FuseResult<InodeRef> {
        let directory = live_directory(parent)?;
        if let Some(id) = directory.child(name)
            && let Some(inode) = self.existing(id)?
        {
            return Ok(inode);
        }
        if !parent.is_bound() {
            return Err(FuseError::NotFound);
        }
        let node = self.client.lookup(parent.handle(), name).map_err(not_found)?;
        Ok(self.materialize(&node, Some(parent.clone())))
    }

    /// Every child of `parent`, remote and pending, sorted by name.
    pub fn children(&self, parent: &InodeRef) -> FuseResult<Vec<InodeRef>> {
        let directory = live_directory(parent)?;
        let mut children: Vec<InodeRef> = self
            .client
            .children(parent.handle())?
            .iter()
            .map(|node| self.materialize(node, Some(parent.clone())))
            .collect();

        for (_, id) in directory.children() {
            if id.is_synthetic()
                && let Ok(Some(inode)) = self.existing(id)
            {
                children.push(inode);
            }
        }
        children.sort_by_key(|child| child.name());
        Ok(children)
    }

    /// Creates a directory remotely and returns its inode.
    pub fn make_directory(&self, parent: &InodeRef, name: &str) -> FuseResult<InodeRef> {
        live_directory(parent)?;
        self.ensure_vacant(parent, name)?;
        let node = self.client.make_directory(parent.handle(), name)?;
        debug!(parent = %parent.id(), name, handle = %node.handle, "Directory created");
        Ok(self.materialize(&node, Some(parent.clone())))
    }

    /// Creates a local file. It has a synthetic ID and stays in memory
    /// until it is bound or removed.
    pub fn create_file(&self, parent: &InodeRef, name: &str) -> FuseResult<InodeRef> {
        let directory = live_directory(parent)?;
        self.ensure_vacant(parent, name)?;

        let id = self.allocate_id()?;
        let bind_handle = BindHandle::generate();
        let info = InodeInfo {
            id,
            handle: NodeHandle::UNDEF,
            parent: Some(parent.id()),
            name: name.to_string(),
            is_directory: false,
            size: 0,
            modified: now(),
            permissions: AccessLevel::Full,
        };
        let inode = Inode::new(
            Self::badge(),
            info,
            InodeKind::File(FileInode::new(bind_handle.clone())),
            Some(parent.clone()),
            self.this.clone(),
        );

        let displaced = {
            let mut state = self.state.lock();
            state.inodes.insert(id, Arc::clone(&inode));
            state.bindings.insert(bind_handle, id);
            state.pinned.insert(id, Ref::new(Arc::clone(&inode)));
            directory.link(name, id)
        };
        if let Some(other) = displaced {
            warn!(%other, name, "Created file displaced an in-memory entry");
        }
        debug!(%id, parent = %parent.id(), name, "File created");
        Ok(Ref::new(inode))
    }

    /// Promotes a local file to the node `handle`. Binding an inode to the
    /// handle it already has does nothing.
    pub fn bind(&self, inode: &InodeRef, handle: NodeHandle) -> FuseResult<()> {
        let released = {
            let mut state = self.state.lock();
            self.bind_locked(&mut state, inode, handle)?
        };
        drop(released);
        Ok(())
    }

    fn bind_locked(&self, state: &mut State, inode: &Inode, handle: NodeHandle) -> FuseResult<Released> {
        if inode.handle() == handle {
            return Ok(Vec::new());
        }
        if inode.is_bound() || inode.removed() || handle.is_undef() {
            return Err(FuseError::InvalidArgument(format!(
                "cannot bind inode {} to {handle}",
                inode.id()
            )));
        }

        let old = inode.id();
        let new = InodeID::from_handle(handle);
        let entry = state.inodes.remove(&old).ok_or(FuseError::NotFound)?;
        let mut released = Vec::new();

        if let Some(other) = state.inodes.remove(&new) {
            self.tombstone_locked(state, &other, &mut released);
        }

        inode.update(Self::badge(), |info| {
            info.id = new;
            info.handle = handle;
        });
        if let Some(parent) = inode.parent()
            && let Some(directory) = parent.directory()
        {
            directory.link(&inode.name(), new);
            released.push(parent);
        }
        if let Some(file) = inode.file() {
            state.bindings.remove(&file.clear_bind_handle());
        }
        released.extend(state.pinned.remove(&old));
        released.extend(self.cache.add(Ref::new(Arc::clone(&entry))));
        state.inodes.insert(new, entry);

        debug!(%old, %new, %handle, "Inode bound");
        Ok(released)
    }

    /// Renames `inode` within its directory.
    pub fn rename(&self, inode: &InodeRef, name: &str) -> FuseResult<()> {
        let parent = inode.parent().ok_or(FuseError::PermissionDenied)?;
        self.move_inode(inode, &parent, name)
    }

    /// Moves `inode` under `parent` as `name`.
    pub fn move_inode(&self, inode: &InodeRef, parent: &InodeRef, name: &str) -> FuseResult<()> {
        if inode.removed() {
            return Err(FuseError::NotFound);
        }
        live_directory(parent)?;
        let current = inode.parent().ok_or(FuseError::PermissionDenied)?;
        if Ref::ptr_eq(&current, parent) && inode.name() == name {
            return Ok(());
        }
        match self.lookup(parent, name) {
            Ok(other) if other.id() != inode.id() => return Err(FuseError::Exists),
            Ok(_) | Err(FuseError::NotFound) => {}
            Err(e) => return Err(e),
        }

        if inode.is_bound() {
            if Ref::ptr_eq(&current, parent) {
                self.client.rename(inode.handle(), name)?;
            } else {
                self.client.move_node(inode.handle(), parent.handle(), name)?;
            }
        }

        let released = {
            let _state = self.state.lock();
            self.relocate_locked(inode, parent, name)
        };
        drop(released);
        debug!(id = %inode.id(), parent = %parent.id(), name, "Inode moved");
        Ok(())
    }

    fn relocate_locked(&self, inode: &Inode, parent: &InodeRef, name: &str) -> Released {
        let id = inode.id();
        let mut released = Vec::new();
        if let Some(current) = inode.parent() {
            if let Some(directory) = current.directory() {
                directory.unlink(&inode.name(), id);
            }
            released.push(current);
        }
        if let Some(directory) = parent.directory() {
            directory.link(name, id);
        }
        inode.update(Self::badge(), |info| {
            info.parent = Some(parent.id());
            info.name = name.to_string();
        });
        released.extend(inode.set_parent(Self::badge(), Some(parent.clone())));
        released
    }

    /// Removes `inode` remotely and tombstones it. Directories must be empty.
    pub fn remove(&self, inode: &InodeRef) -> FuseResult<()> {
        if inode.removed() {
            return Err(FuseError::NotFound);
        }
        if inode.parent().is_none() {
            return Err(FuseError::PermissionDenied);
        }
        if let Some(directory) = inode.directory() {
            let pending = directory.children().iter().any(|(_, id)| id.is_synthetic());
            if pending || !self.client.children(inode.handle())?.is_empty() {
                return Err(FuseError::NotEmpty);
            }
        }
        if inode.is_bound() {
            match self.client.remove(inode.handle()) {
                Ok(()) | Err(ClientError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.tombstone(inode);
        debug!(id = %inode.id(), "Inode removed");
        Ok(())
    }

    /// Whether `id` names an entry that has not been removed.
    pub fn exists(&self, id: InodeID) -> bool {
        match self.existing(id) {
            Ok(Some(_)) => true,
            Err(_) => false,
            Ok(None) => id.handle().is_some_and(|handle| self.client.exists(handle)),
        }
    }

    /// Attributes of the inode with `id`.
    pub fn info(&self, id: InodeID) -> FuseResult<InodeInfo> {
        self.get(id).map(|inode| inode.info())
    }

    /// While set, node events are dropped instead of applied.
    pub fn discard(&self, discard: bool) {
        debug!(discard, "Node event discarding changed");
        self.discard.store(discard, Ordering::Release);
    }

    pub fn discarding(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }

    pub fn cache_flags(&self) -> InodeCacheFlags {
        self.cache.flags()
    }

    pub fn set_cache_flags(&self, flags: InodeCacheFlags) {
        drop(self.cache.set_flags(flags));
    }

    /// Number of inodes held by the cache.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds the inode with `id`.
    pub fn cached(&self, id: InodeID) -> bool {
        self.cache.contains(id)
    }

    /// Runs a cache cleaning pass now.
    pub fn clean_cache(&self) {
        drop(self.cache.clean());
    }

    /// Drops every cached inode.
    pub fn clear_cache(&self) {
        drop(self.cache.clear());
    }

    /// Number of inodes in memory, removed ones included.
    pub fn len(&self) -> usize {
        self.state.lock().inodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an inode with `id` is in memory, removed or not.
    pub fn in_memory(&self, id: InodeID) -> bool {
        self.state.lock().inodes.contains_key(&id)
    }

    /// Applies a batch of node events to the inodes in memory.
    pub fn apply(&self, events: &NodeEventQueue) {
        let _entered = self.span.enter();
        if self.discarding() {
            debug!(events = events.len(), "Discarding node events");
            return;
        }
        for event in events.iter() {
            trace!(event = ?event.event_type, handle = %event.handle, "Applying node event");
            if let Err(e) = self.apply_one(event) {
                warn!(event = ?event.event_type, handle = %event.handle, error = %e, "Failed to apply node event");
            }
        }
    }

    fn apply_one(&self, event: &NodeEvent) -> FuseResult<()> {
        let id = InodeID::from_handle(event.handle);
        match event.event_type {
            NodeEventType::Added | NodeEventType::Modified => {
                if self.bind_pending(event)? {
                    return Ok(());
                }
                if let Some(inode) = self.existing(id)? {
                    refresh(&inode, event);
                    return Ok(());
                }
                if event.event_type == NodeEventType::Added {
                    self.displace(event);
                }
                Ok(())
            }
            NodeEventType::Moved => {
                let Some(inode) = self.existing(id)? else {
                    return Ok(());
                };
                let Some(current) = inode.parent() else {
                    return Ok(());
                };
                if current.handle() == event.parent && inode.name() == event.name {
                    return Ok(());
                }
                match self.get(InodeID::from_handle(event.parent)) {
                    Ok(parent) => {
                        let released = {
                            let _state = self.state.lock();
                            self.relocate_locked(&inode, &parent, &event.name)
                        };
                        drop(released);
                    }
                    Err(e) => {
                        debug!(%id, error = %e, "Moved outside of reach, removing");
                        self.tombstone(&inode);
                    }
                }
                Ok(())
            }
            NodeEventType::Removed => {
                if let Some(inode) = self.existing(id)? {
                    self.tombstone(&inode);
                }
                Ok(())
            }
            NodeEventType::Permissions => {
                if let Some(inode) = self.existing(id)? {
                    inode.update(Self::badge(), |info| info.permissions = event.permissions);
                }
                Ok(())
            }
        }
    }

    /// Binds the local file whose upload produced `event`, if any.
    fn bind_pending(&self, event: &NodeEvent) -> FuseResult<bool> {
        if event.bind_handle.is_empty() {
            return Ok(false);
        }
        let released = {
            let mut state = self.state.lock();
            let Some(id) = state.bindings.get(&event.bind_handle).copied() else {
                return Ok(false);
            };
            let Some(inode) = state.inodes.get(&id).cloned() else {
                return Ok(false);
            };
            let released = self.bind_locked(&mut state, &inode, event.handle)?;
            refresh(&inode, event);
            released
        };
        drop(released);
        Ok(true)
    }

    /// A new node took a name held by a different inode in memory.
    fn displace(&self, event: &NodeEvent) {
        let Ok(Some(parent)) = self.existing(InodeID::from_handle(event.parent)) else {
            return;
        };
        let Some(other) = parent.directory().and_then(|d| d.child(&event.name)) else {
            return;
        };
        if other == InodeID::from_handle(event.handle) {
            return;
        }
        if let Ok(Some(inode)) = self.existing(other) {
            debug!(%other, name = %event.name, "Inode replaced by new node");
            self.tombstone(&inode);
        }
    }

    fn tombstone(&self, inode: &Inode) {
        let released = {
            let mut state = self.state.lock();
            let mut released = Vec::new();
            self.tombstone_locked(&mut state, inode, &mut released);
            released
        };
        drop(released);
    }

    fn tombstone_locked(&self, state: &mut State, inode: &Inode, released: &mut Released) {
        if !inode.mark_removed(Self::badge()) {
            return;
        }
        let id = inode.id();
        if let Some(parent) = inode.parent() {
            if let Some(directory) = parent.directory() {
                directory.unlink(&inode.name(), id);
            }
            released.push(parent);
        }
        if let Some(file) = inode.file() {
            state.bindings.remove(&file.bind_handle());
        }
        released.extend(state.pinned.remove(&id));
        released.extend(self.cache.remove(id));
        debug!(%id, references = inode.references(), "Inode tombstoned");
    }

    /// Called when the last reference to `inode` has been released.
    pub(crate) fn released(&self, inode: &Inode) {
        let entry = {
            let mut state = self.state.lock();
            if inode.references() > 0 {
                return;
            }
            let id = inode.id();
            match state.inodes.get(&id) {
                Some(entry) if std::ptr::eq(Arc::as_ptr(entry), inode) => {}
                _ => return,
            }
            if let Some(parent) = inode.parent()
                && let Some(directory) = parent.directory()
            {
                directory.unlink(&inode.name(), id);
            }
            trace!(%id, removed = inode.removed(), "Inode evicted");
            state.inodes.remove(&id)
        };
        drop(entry);
    }

    /// A reference to the live inode with `id`, if it is in memory.
    fn existing(&self, id: InodeID) -> FuseResult<Option<InodeRef>> {
        let (inode, released) = {
            let state = self.state.lock();
            let Some(entry) = state.inodes.get(&id) else {
                return Ok(None);
            };
            if entry.removed() {
                return Err(FuseError::NotFound);
            }
            self.reference(entry)
        };
        drop(released);
        Ok(Some(inode))
    }

    /// Creates a reference under the lock, marking the inode used.
    fn reference(&self, entry: &Arc<Inode>) -> (InodeRef, Released) {
        let inode = Ref::new(Arc::clone(entry));
        let released = if inode.is_bound() {
            self.cache.add(inode.clone())
        } else {
            Vec::new()
        };
        (inode, released)
    }

    /// The inode for `node`, created if it is not in memory.
    fn materialize(&self, node: &NodeInfo, parent: Option<InodeRef>) -> InodeRef {
        let id = InodeID::from_handle(node.handle);
        let parent_id = parent.as_ref().map(|parent| parent.id());
        let (inode, released, previous) = {
            let mut state = self.state.lock();
            if let Some(entry) = state.inodes.get(&id)
                && !entry.removed()
            {
                entry.update(Self::badge(), |info| {
                    info.size = node.size;
                    info.modified = node.modified;
                    info.permissions = node.permissions;
                });
                let (inode, mut released) = self.reference(entry);
                released.extend(parent);
                (inode, released, None)
            } else {
                let kind = if node.is_directory {
                    InodeKind::Directory(DirectoryInode::default())
                } else {
                    InodeKind::File(FileInode::default())
                };
                if let Some(directory) = parent.as_ref().and_then(|parent| parent.directory()) {
                    directory.link(&node.name, id);
                }
                let entry = Inode::new(
                    Self::badge(),
                    InodeInfo::from_node(node, parent_id),
                    kind,
                    parent,
                    self.this.clone(),
                );
                trace!(%id, name = %node.name, "Inode materialized");
                let (inode, released) = self.reference(&entry);
                // A removed inode with the same ID lives on through its references.
                let previous = state.inodes.insert(id, entry);
                (inode, released, previous)
            }
        };
        drop(released);
        drop(previous);
        inode
    }

    fn ensure_vacant(&self, parent: &InodeRef, name: &str) -> FuseResult<()> {
        match self.lookup(parent, name) {
            Ok(_) => Err(FuseError::Exists),
            Err(FuseError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn allocate_id(&self) -> FuseResult<InodeID> {
        let tx = self.database.transaction()?;
        let next: i64 = {
            let mut query = tx.query("SELECT next FROM inode_ids");
            query.execute()?;
            match query.first() {
                Some(row) => row.field("next")?,
                None => 1,
            }
        };
        tx.query("UPDATE inode_ids SET next = next + 1").execute()?;
        tx.commit()?;

        u64::try_from(next)
            .ok()
            .and_then(InodeID::synthetic)
            .ok_or_else(|| FuseError::InvalidArgument("synthetic inode IDs exhausted".into()))
    }
}

impl std::fmt::Debug for InodeDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeDB")
            .field("inodes", &self.len())
            .field("cached", &self.cache_size())
            .finish_non_exhaustive()
    }
}

fn live_directory(inode: &InodeRef) -> FuseResult<&DirectoryInode> {
    if inode.removed() {
        return Err(FuseError::NotFound);
    }
    inode.directory().ok_or(FuseError::NotDirectory)
}

fn refresh(inode: &Inode, event: &NodeEvent) {
    if inode.is_directory() {
        return;
    }
    inode.update(InodeDB::badge(), |info| {
        info.size = event.size;
        info.modified = event.modified;
        info.permissions = event.permissions;
    });
}

fn not_found(e: ClientError) -> FuseError {
    match e {
        ClientError::NotFound => FuseError::NotFound,
        other => FuseError::Client(other),
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::testing::{MockClient, init_tracing};
    use std::time::Duration;

    fn setup(flags: InodeCacheFlags) -> (Arc<MockClient>, Arc<InodeDB>) {
        init_tracing();
        let client = MockClient::new();
        let database = Arc::new(Database::in_memory().unwrap());
        let db = InodeDB::new(client.clone(), database, flags).unwrap();
        (client, db)
    }

    fn quiet_cache() -> InodeCacheFlags {
        InodeCacheFlags::default()
            .with_clean_interval(Duration::from_secs(3600))
            .with_clean_age_threshold(Duration::from_secs(3600))
    }

    #[test]
    fn test_get_materializes_ancestors() {
        let (client, db) = setup(quiet_cache());
        let docs = client.add_directory(client.root(), "docs");
        let file = client.add_file(docs, "a.txt", b"hello".to_vec());

        let inode = db.get(InodeID::from_handle(file)).unwrap();
        assert_eq!(inode.name(), "a.txt");
        assert_eq!(inode.info().size, 5);

        let parent = inode.parent().unwrap();
        assert_eq!(parent.handle(), docs);
        assert_eq!(parent.directory().unwrap().child("a.txt"), Some(inode.id()));
        assert!(parent.parent().unwrap().parent().is_none());
        assert_eq!(db.len(), 3);
    }

    #[test]
    fn test_lookup_and_children() {
        let (client, db) = setup(quiet_cache());
        client.add_file(client.root(), "b.txt", Vec::new());
        client.add_directory(client.root(), "a");

        let root = db.root(client.root()).unwrap();
        let names: Vec<String> = db.children(&root).unwrap().iter().map(|c| c.name()).collect();
        assert_eq!(names, ["a", "b.txt"]);

        let b = db.lookup(&root, "b.txt").unwrap();
        let again = db.lookup(&root, "b.txt").unwrap();
        assert!(Ref::ptr_eq(&b, &again));
        assert!(matches!(db.lookup(&root, "missing"), Err(FuseError::NotFound)));
        assert!(matches!(db.lookup(&b, "x"), Err(FuseError::NotDirectory)));
    }

    #[test]
    fn test_max_size_evicts_unreferenced_inodes() {
        let (client, db) = setup(quiet_cache().with_max_size(2));
        let a = client.add_file(client.root(), "a", Vec::new());
        let b = client.add_file(client.root(), "b", Vec::new());

        drop(db.get(InodeID::from_handle(a)).unwrap());
        assert!(db.in_memory(InodeID::from_handle(a)));

        drop(db.get(InodeID::from_handle(b)).unwrap());
        assert_eq!(db.cache_size(), 2);
        assert!(!db.in_memory(InodeID::from_handle(a)));
        assert!(db.in_memory(InodeID::from_handle(b)));
        assert!(db.in_memory(InodeID::from_handle(client.root())));
    }

    #[test]
    fn test_referenced_inodes_survive_eviction() {
        let (client, db) = setup(quiet_cache().with_clean_age_threshold(Duration::ZERO));
        let a = client.add_file(client.root(), "a", Vec::new());

        let held = db.get(InodeID::from_handle(a)).unwrap();
        db.clean_cache();
        assert_eq!(db.cache_size(), 0);
        assert!(db.in_memory(held.id()));
        assert!(db.in_memory(InodeID::from_handle(client.root())));

        drop(held);
        assert!(db.is_empty());
    }

    #[test]
    fn test_removed_inode_lives_until_released() {
        let (client, db) = setup(quiet_cache());
        let a = client.add_file(client.root(), "a", Vec::new());
        let id = InodeID::from_handle(a);

        let inode = db.get(id).unwrap();
        db.remove(&inode).unwrap();
        assert!(inode.removed());
        assert!(!client.exists(a));
        assert!(db.in_memory(id));
        assert!(!db.cached(id));
        assert!(matches!(db.get(id), Err(FuseError::NotFound)));
        assert!(!db.exists(id));

        drop(inode);
        assert!(!db.in_memory(id));
    }

    #[test]
    fn test_remove_rejects_non_empty_directories() {
        let (client, db) = setup(quiet_cache());
        let docs = client.add_directory(client.root(), "docs");
        client.add_file(docs, "a", Vec::new());

        let inode = db.get(InodeID::from_handle(docs)).unwrap();
        assert!(matches!(db.remove(&inode), Err(FuseError::NotEmpty)));
        let root = db.root(client.root()).unwrap();
        assert!(matches!(db.remove(&root), Err(FuseError::PermissionDenied)));
    }

    #[test]
    fn test_created_files_are_pinned_until_bound() {
        let (client, db) = setup(quiet_cache().with_clean_age_threshold(Duration::ZERO));
        let root = db.root(client.root()).unwrap();

        let file = db.create_file(&root, "new.txt").unwrap();
        let synthetic = file.id();
        assert!(synthetic.is_synthetic());
        assert!(!file.is_bound());
        assert!(matches!(db.create_file(&root, "new.txt"), Err(FuseError::Exists)));

        drop(file);
        db.clean_cache();
        let file = db.lookup(&root, "new.txt").unwrap();
        assert_eq!(file.id(), synthetic);

        let handle = client.add_file(client.root(), "new.txt", b"data".to_vec());
        db.bind(&file, handle).unwrap();
        db.bind(&file, handle).unwrap();
        assert_eq!(file.id(), InodeID::from_handle(handle));
        assert!(file.file().unwrap().bind_handle().is_empty());
        assert!(!db.in_memory(synthetic));
        assert_eq!(root.directory().unwrap().child("new.txt"), Some(file.id()));
        assert!(db.cached(file.id()));
    }

    #[test]
    fn test_upload_event_binds_pending_file() {
        let (client, db) = setup(quiet_cache());
        let root = db.root(client.root()).unwrap();
        let file = db.create_file(&root, "new.txt").unwrap();
        let bind_handle = file.file().unwrap().bind_handle();

        let handle = client.add_file(client.root(), "new.txt", b"data".to_vec());
        let mut events = NodeEventQueue::new();
        events.push(
            NodeEvent::new(NodeEventType::Added, handle)
                .with_location(client.root(), "new.txt")
                .with_content(4, 1_700_000_000)
                .with_bind_handle(bind_handle),
        );
        db.apply(&events);

        assert_eq!(file.handle(), handle);
        assert_eq!(file.info().size, 4);
        assert_eq!(file.info().modified, 1_700_000_000);
    }

    #[test]
    fn test_synthetic_ids_are_never_reused() {
        init_tracing();
        let client = MockClient::new();
        let database = Arc::new(Database::in_memory().unwrap());

        let first = {
            let db = InodeDB::new(client.clone(), Arc::clone(&database), quiet_cache()).unwrap();
            let root = db.root(client.root()).unwrap();
            let file = db.create_file(&root, "a").unwrap();
            db.remove(&file).unwrap();
            file.id()
        };

        let db = InodeDB::new(client.clone(), database, quiet_cache()).unwrap();
        let root = db.root(client.root()).unwrap();
        let second = db.create_file(&root, "a").unwrap().id();
        assert!(second.as_u64() > first.as_u64());
    }

    #[test]
    fn test_rename_and_move() {
        let (client, db) = setup(quiet_cache());
        let docs = client.add_directory(client.root(), "docs");
        let a = client.add_file(client.root(), "a", Vec::new());
        client.add_file(client.root(), "taken", Vec::new());

        let root = db.root(client.root()).unwrap();
        let inode = db.lookup(&root, "a").unwrap();
        assert!(matches!(db.rename(&inode, "taken"), Err(FuseError::Exists)));

        db.rename(&inode, "b").unwrap();
        assert_eq!(client.get(a).unwrap().name, "b");
        assert_eq!(root.directory().unwrap().child("b"), Some(inode.id()));
        assert_eq!(root.directory().unwrap().child("a"), None);

        let target = db.lookup(&root, "docs").unwrap();
        db.move_inode(&inode, &target, "c").unwrap();
        assert_eq!(client.get(a).unwrap().parent, docs);
        assert!(Ref::ptr_eq(&inode.parent().unwrap(), &target));
        assert_eq!(inode.info().parent, Some(target.id()));
    }

    #[test]
    fn test_remote_events_update_inodes() {
        let (client, db) = setup(quiet_cache());
        let docs = client.add_directory(client.root(), "docs");
        let a = client.add_file(client.root(), "a", Vec::new());
        let root = db.root(client.root()).unwrap();
        let inode = db.lookup(&root, "a").unwrap();

        let mut events = NodeEventQueue::new();
        events.push(
            NodeEvent::new(NodeEventType::Moved, a).with_location(docs, "moved"),
        );
        events.push(
            NodeEvent::new(NodeEventType::Permissions, a)
                .with_permissions(AccessLevel::ReadOnly),
        );
        db.apply(&events);
        assert_eq!(inode.name(), "moved");
        assert_eq!(inode.parent().unwrap().handle(), docs);
        assert_eq!(inode.info().permissions, AccessLevel::ReadOnly);

        let mut events = NodeEventQueue::new();
        events.push(NodeEvent::new(NodeEventType::Removed, a));
        db.discard(true);
        db.apply(&events);
        assert!(!inode.removed());

        db.discard(false);
        db.apply(&events);
        assert!(inode.removed());
    }
}

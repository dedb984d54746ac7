//! The set of known mounts and their lifecycle.
//!
//! ```text
//!            add            enable              disable
//!   (none) ──────▶ Disabled ──────▶ Enabling ──▶ Enabled ──────▶ Disabling ──▶ Disabled
//!                     │                 │                                          │
//!                     │ remove          └── platform failure ──▶ Disabled          │
//!                     ▼                                                            │
//!                  Removed ◀───────────────────────── remove ──────────────────────┘
//! ```
//!
//! Structural changes are serialized by the database's own lock, which is
//! never held while a platform session starts or drains. Mounts flagged
//! `persistent` are stored in the `mounts` table and reloaded on startup.
//! Every completed transition is announced to subscribers as a
//! [`MountEvent`].

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use nimbus_core::database::QueryTarget;
use nimbus_core::{
    ClientError, DatabaseResult, Migration, NodeHandle, NormalizedPath, QueryRow, ScopedQuery,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::MountFlags;
use crate::error::{FuseError, FuseResult, MountResult};
use crate::mount::{Mount, MountInfo, MountPlatform, MountSession, MountState};
use crate::service::ServiceContext;

const COMPONENT: &str = "mount_db";

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "mounts",
    sql: r"
        CREATE TABLE mounts (
            name TEXT PRIMARY KEY NOT NULL,
            handle INTEGER NOT NULL,
            path TEXT NOT NULL,
            enable_at_startup INTEGER NOT NULL DEFAULT 0,
            persistent INTEGER NOT NULL DEFAULT 1,
            read_only INTEGER NOT NULL DEFAULT 0
        );
    ",
}];

const SELECT_MOUNTS: &str =
    "SELECT name, handle, path, enable_at_startup, persistent, read_only FROM mounts ORDER BY name";

const UPSERT_MOUNT: &str = "INSERT OR REPLACE INTO mounts \
     (name, handle, path, enable_at_startup, persistent, read_only) \
     VALUES (:name, :handle, :path, :enable_at_startup, :persistent, :read_only)";

const DELETE_MOUNT: &str = "DELETE FROM mounts WHERE name = :name";

/// What happened to a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountEventType {
    Added,
    Changed,
    Disabled,
    Enabled,
    Removed,
}

/// A completed mount transition, or a failed attempt at one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEvent {
    pub name: String,
    pub result: MountResult,
    pub event_type: MountEventType,
}

struct Session {
    mount: Arc<Mount>,
    session: Arc<dyn MountSession>,
    thread: JoinHandle<()>,
    /// Disconnects once `run` returns.
    finished: Receiver<()>,
}

struct Entry {
    info: MountInfo,
    state: MountState,
    session: Option<Session>,
}

/// Tracks every known mount.
pub struct MountDB {
    context: Arc<ServiceContext>,
    platform: Arc<dyn MountPlatform>,
    entries: Mutex<BTreeMap<String, Entry>>,
    subscribers: Mutex<Vec<Sender<MountEvent>>>,
}

impl MountDB {
    /// Opens the database, loading every persisted mount as disabled.
    pub(crate) fn new(context: Arc<ServiceContext>, platform: Arc<dyn MountPlatform>) -> FuseResult<Self> {
        context.database.migrate(COMPONENT, MIGRATIONS)?;
        let records = load(&context)?;
        debug!(mounts = records.len(), "Mount records loaded");

        let entries = records
            .into_iter()
            .map(|info| {
                let entry = Entry {
                    info,
                    state: MountState::Disabled,
                    session: None,
                };
                (entry.info.flags.name.clone(), entry)
            })
            .collect();

        Ok(Self {
            context,
            platform,
            entries: Mutex::new(entries),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Receives every mount event emitted from now on.
    pub fn subscribe(&self) -> Receiver<MountEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, name: &str, event_type: MountEventType, result: MountResult) {
        let event = MountEvent {
            name: name.to_string(),
            result,
            event_type,
        };
        debug!(name, event = ?event_type, %result, "Mount event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Checks what can be checked without the lock.
    fn check(&self, info: &MountInfo) -> MountResult {
        let node = match self.context.client.get(info.handle) {
            Ok(node) => node,
            Err(ClientError::NotFound) => return MountResult::RemoteUnknown,
            Err(e) => {
                warn!(handle = %info.handle, error = %e, "Could not query mount root");
                return MountResult::Unexpected;
            }
        };
        if info.flags.name.is_empty() {
            return MountResult::NoName;
        }
        if !node.is_directory {
            return MountResult::RemoteFile;
        }
        if info.path.is_empty() {
            return MountResult::LocalUnknown;
        }
        self.platform.check(&info.path)
    }

    /// Adds a mount. Enables it at once if flagged `enable_at_startup`.
    pub fn add(&self, info: MountInfo) -> MountResult {
        let name = info.flags.name.clone();
        let result = self.check(&info);
        if !result.is_success() {
            debug!(name, %result, "Mount rejected");
            return result;
        }

        {
            let mut entries = self.entries.lock();
            if entries.values().any(|entry| overlaps(&entry.info.path, &info.path)) {
                return MountResult::LocalTaken;
            }
            if entries.contains_key(&name) {
                return MountResult::NameTaken;
            }
            if info.flags.persistent
                && let Err(e) = save(&self.context, &info)
            {
                error!(name, error = %e, "Failed to persist mount");
                return MountResult::Unexpected;
            }
            entries.insert(
                name.clone(),
                Entry {
                    info: info.clone(),
                    state: MountState::Disabled,
                    session: None,
                },
            );
        }

        info!(name, path = %info.path, handle = %info.handle, "Mount added");
        self.emit(&name, MountEventType::Added, MountResult::Success);

        if info.flags.enable_at_startup {
            return self.enable(&name, false);
        }
        MountResult::Success
    }

    /// Enables a disabled mount. With `remember`, the mount is also enabled
    /// on future startups.
    pub fn enable(&self, name: &str, remember: bool) -> MountResult {
        let info = {
            let mut entries = self.entries.lock();
            let taken = match entries.get(name) {
                None => return MountResult::Unknown,
                Some(entry) if entry.state != MountState::Disabled => return MountResult::Busy,
                Some(entry) => entries.iter().any(|(other, candidate)| {
                    other != name
                        && matches!(candidate.state, MountState::Enabling | MountState::Enabled)
                        && overlaps(&candidate.info.path, &entry.info.path)
                }),
            };
            if taken {
                return MountResult::LocalTaken;
            }
            let Some(entry) = entries.get_mut(name) else {
                return MountResult::Unknown;
            };
            entry.state = MountState::Enabling;
            entry.info.clone()
        };

        let started = self.start(&info);

        let result = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(name) else {
                return MountResult::Unknown;
            };
            match started {
                Ok(session) => {
                    entry.state = MountState::Enabled;
                    entry.session = Some(session);
                    if remember && !entry.info.flags.enable_at_startup {
                        entry.info.flags.enable_at_startup = true;
                        if let Some(session) = &entry.session {
                            session.mount.set_info(entry.info.clone());
                        }
                        if entry.info.flags.persistent
                            && let Err(e) = save(&self.context, &entry.info)
                        {
                            warn!(name, error = %e, "Failed to remember mount");
                        }
                    }
                    MountResult::Success
                }
                Err(result) => {
                    entry.state = MountState::Disabled;
                    result
                }
            }
        };

        if result.is_success() {
            info!(name, path = %info.path, "Mount enabled");
        } else {
            warn!(name, %result, "Mount could not be enabled");
        }
        self.emit(name, MountEventType::Enabled, result);
        result
    }

    fn start(&self, info: &MountInfo) -> Result<Session, MountResult> {
        let mount = Mount::new(info.clone(), Arc::clone(&self.context)).map_err(|e| match e {
            FuseError::NotFound | FuseError::Removed => MountResult::RemoteUnknown,
            FuseError::NotDirectory => MountResult::RemoteFile,
            other => {
                warn!(name = %info.flags.name, error = %other, "Failed to open mount root");
                MountResult::Unexpected
            }
        })?;

        let session = self.platform.mount(Arc::clone(&mount))?;
        let (finished_tx, finished) = bounded::<()>(0);
        let thread = {
            let session = Arc::clone(&session);
            thread::Builder::new()
                .name(format!("mount-{}", info.flags.name))
                .spawn(move || {
                    let _finished = finished_tx;
                    session.run();
                })
        };
        match thread {
            Ok(thread) => Ok(Session {
                mount,
                session,
                thread,
                finished,
            }),
            Err(e) => {
                error!(name = %info.flags.name, error = %e, "Failed to spawn mount thread");
                session.stop();
                Err(MountResult::Unexpected)
            }
        }
    }

    /// Disables an enabled mount, waiting for its open contexts to close.
    /// With `remember`, the mount is no longer enabled on startup.
    pub fn disable(&self, name: &str, remember: bool) -> MountResult {
        let session = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(name) else {
                return MountResult::Unknown;
            };
            if entry.state != MountState::Enabled {
                return MountResult::Busy;
            }
            entry.state = MountState::Disabling;
            entry.session.take()
        };

        if let Some(Session {
            mount,
            session,
            thread,
            finished,
        }) = session
        {
            let timeout = self.context.flags.read().disable_timeout;
            let _deadline = self
                .context
                .watchdog
                .arm(format!("disable mount {name}"), timeout);
            session.stop();
            match finished.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    error!(name, timeout_ms = timeout.as_millis(), "Mount session did not stop, detaching it");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if thread.join().is_err() {
                        error!(name, "Mount session panicked");
                    }
                }
            }
            mount.wait_idle();
        }

        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(name) {
                entry.state = MountState::Disabled;
                if remember && entry.info.flags.enable_at_startup {
                    entry.info.flags.enable_at_startup = false;
                    if entry.info.flags.persistent
                        && let Err(e) = save(&self.context, &entry.info)
                    {
                        warn!(name, error = %e, "Failed to remember mount");
                    }
                }
            }
        }

        info!(name, "Mount disabled");
        self.emit(name, MountEventType::Disabled, MountResult::Success);
        MountResult::Success
    }

    /// Forgets a disabled mount.
    pub fn remove(&self, name: &str) -> MountResult {
        {
            let mut entries = self.entries.lock();
            match entries.get_mut(name) {
                None => return MountResult::Unknown,
                Some(entry) if entry.state != MountState::Disabled => return MountResult::Busy,
                Some(entry) => entry.state = MountState::Removed,
            }
            if let Err(e) = delete(&self.context, name) {
                error!(name, error = %e, "Failed to delete mount record");
                if let Some(entry) = entries.get_mut(name) {
                    entry.state = MountState::Disabled;
                }
                return MountResult::Unexpected;
            }
            entries.remove(name);
        }

        info!(name, "Mount removed");
        self.emit(name, MountEventType::Removed, MountResult::Success);
        MountResult::Success
    }

    /// Replaces a mount's flags, renaming it if the name changes.
    pub fn set_flags(&self, name: &str, flags: MountFlags) -> MountResult {
        if flags.name.is_empty() {
            return MountResult::NoName;
        }
        let new_name = flags.name.clone();

        {
            let mut entries = self.entries.lock();
            match entries.get(name) {
                None => return MountResult::Unknown,
                Some(entry)
                    if matches!(entry.state, MountState::Enabling | MountState::Disabling) =>
                {
                    return MountResult::Busy;
                }
                Some(_) => {}
            }
            if new_name != name && entries.contains_key(&new_name) {
                return MountResult::NameTaken;
            }
            let Some(mut entry) = entries.remove(name) else {
                return MountResult::Unknown;
            };

            let previous = std::mem::replace(&mut entry.info.flags, flags);
            if let Err(e) = persist_change(&self.context, name, &entry.info) {
                error!(name, error = %e, "Failed to persist mount flags");
                entry.info.flags = previous;
                entries.insert(name.to_string(), entry);
                return MountResult::Unexpected;
            }
            if let Some(session) = &entry.session {
                session.mount.set_info(entry.info.clone());
            }
            entries.insert(new_name.clone(), entry);
        }

        debug!(name, new_name, "Mount flags changed");
        self.emit(&new_name, MountEventType::Changed, MountResult::Success);
        MountResult::Success
    }

    /// Whether the mount `name` is enabled.
    pub fn enabled(&self, name: &str) -> bool {
        self.state(name) == Some(MountState::Enabled)
    }

    /// The enabled mount called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Mount>> {
        let entries = self.entries.lock();
        let session = entries.get(name)?.session.as_ref()?;
        Some(Arc::clone(&session.mount))
    }

    pub fn info(&self, name: &str) -> Option<MountInfo> {
        self.entries.lock().get(name).map(|entry| entry.info.clone())
    }

    /// The state of `name`, or `None` if no such mount is known.
    pub fn state(&self, name: &str) -> Option<MountState> {
        self.entries.lock().get(name).map(|entry| entry.state)
    }

    pub fn path(&self, name: &str) -> Option<NormalizedPath> {
        self.entries.lock().get(name).map(|entry| entry.info.path.clone())
    }

    /// Every known mount, sorted by name.
    pub fn mounts(&self) -> Vec<MountInfo> {
        self.entries
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Forgets every disabled mount that is not persistent.
    pub fn prune(&self) -> usize {
        let pruned: Vec<String> = {
            let mut entries = self.entries.lock();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| !entry.info.flags.persistent && entry.state == MountState::Disabled)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                entries.remove(name);
            }
            names
        };

        for name in &pruned {
            self.emit(name, MountEventType::Removed, MountResult::Success);
        }
        pruned.len()
    }

    /// Enables every disabled mount flagged `enable_at_startup`.
    pub fn enable_at_startup(&self) -> Vec<(String, MountResult)> {
        let names: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.info.flags.enable_at_startup && entry.state == MountState::Disabled)
            .map(|(name, _)| name.clone())
            .collect();

        names
            .into_iter()
            .map(|name| {
                let result = self.enable(&name, false);
                (name, result)
            })
            .collect()
    }

    /// Disables every enabled mount.
    pub fn disable_all(&self) {
        let names: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.state == MountState::Enabled)
            .map(|(name, _)| name.clone())
            .collect();

        for name in names {
            let result = self.disable(&name, false);
            if !result.is_success() {
                warn!(name, %result, "Failed to disable mount");
            }
        }
    }
}

impl Drop for MountDB {
    fn drop(&mut self) {
        self.disable_all();
    }
}

impl std::fmt::Debug for MountDB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock();
        f.debug_map()
            .entries(entries.iter().map(|(name, entry)| (name, entry.state)))
            .finish()
    }
}

/// Whether two mount paths would nest.
fn overlaps(a: &NormalizedPath, b: &NormalizedPath) -> bool {
    a.is_prefix_of(b) || b.is_prefix_of(a)
}

fn load(context: &ServiceContext) -> DatabaseResult<Vec<MountInfo>> {
    let mut query = context.database.query(SELECT_MOUNTS);
    query.execute()?;
    query.rows().map(|row| info_from_row(&row)).collect()
}

fn info_from_row(row: &QueryRow<'_>) -> DatabaseResult<MountInfo> {
    let handle: i64 = row.field("handle")?;
    let path: String = row.field("path")?;
    Ok(MountInfo {
        flags: MountFlags {
            name: row.field("name")?,
            enable_at_startup: row.field("enable_at_startup")?,
            persistent: row.field("persistent")?,
            read_only: row.field("read_only")?,
        },
        handle: NodeHandle::new(u64::try_from(handle).unwrap_or_default()),
        path: NormalizedPath::new(path),
    })
}

fn bind_info<'q, T: QueryTarget>(query: &'q mut ScopedQuery<T>, info: &MountInfo) -> &'q mut ScopedQuery<T> {
    query
        .param(":name", info.flags.name.as_str())
        .param(":handle", i64::try_from(info.handle.as_u64()).unwrap_or(i64::MAX))
        .param(":path", info.path.to_string_lossy())
        .param(":enable_at_startup", info.flags.enable_at_startup)
        .param(":persistent", info.flags.persistent)
        .param(":read_only", info.flags.read_only)
}

fn save(context: &ServiceContext, info: &MountInfo) -> DatabaseResult<()> {
    bind_info(&mut context.database.query(UPSERT_MOUNT), info).execute()?;
    Ok(())
}

fn delete(context: &ServiceContext, name: &str) -> DatabaseResult<()> {
    let mut query = context.database.query(DELETE_MOUNT);
    query.param(":name", name);
    query.execute()?;
    Ok(())
}

/// Stores `info` in place of the record called `previous`.
fn persist_change(context: &ServiceContext, previous: &str, info: &MountInfo) -> DatabaseResult<()> {
    let tx = context.database.transaction()?;
    {
        let mut query = tx.query(DELETE_MOUNT);
        query.param(":name", previous);
        query.execute()?;
    }
    if info.flags.persistent {
        bind_info(&mut tx.query(UPSERT_MOUNT), info).execute()?;
    }
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_core::Database;

    #[test]
    fn test_overlapping_paths() {
        let root = NormalizedPath::new("/mnt");
        let nested = NormalizedPath::new("/mnt/docs");
        let sibling = NormalizedPath::new("/mnt2");
        assert!(overlaps(&root, &nested));
        assert!(overlaps(&nested, &root));
        assert!(overlaps(&nested, &nested));
        assert!(!overlaps(&root, &sibling));
    }

    #[test]
    fn test_records_round_trip() {
        let database = Database::in_memory().unwrap();
        database.migrate(COMPONENT, MIGRATIONS).unwrap();
        let info = MountInfo::new(
            MountFlags::new("docs")
                .with_persistent(true)
                .with_read_only(true)
                .with_enable_at_startup(true),
            NodeHandle::new(42),
            "/mnt/docs/",
        );

        bind_info(&mut database.query(UPSERT_MOUNT), &info).execute().unwrap();

        let mut query = database.query(SELECT_MOUNTS);
        query.execute().unwrap();
        let loaded = info_from_row(&query.first().unwrap()).unwrap();
        assert_eq!(loaded, info);
    }
}

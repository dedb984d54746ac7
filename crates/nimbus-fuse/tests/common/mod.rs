//! Shared fixtures for the mount service tests.

#![allow(dead_code)]

use nimbus_core::NormalizedPath;
use nimbus_core::testing::{MockClient, init_tracing};
use nimbus_file_service::FileServiceOptions;
use nimbus_fuse::{
    InodeCacheFlags, Mount, MountPlatform, MountResult, MountSession, Service, ServiceFlags,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A session that serves nothing and returns from `run` once stopped.
#[derive(Default)]
pub struct TestSession {
    stopped: Mutex<bool>,
    wake: Condvar,
    ignores_stop: bool,
}

impl TestSession {
    /// A session that keeps running through `stop` until released.
    pub fn stubborn() -> Self {
        Self {
            ignores_stop: true,
            ..Self::default()
        }
    }

    pub fn release(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

impl MountSession for TestSession {
    fn run(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.wake.wait(&mut stopped);
        }
    }

    fn stop(&self) {
        if !self.ignores_stop {
            self.release();
        }
    }
}

/// A platform that records the mounts it is given.
pub struct TestPlatform {
    pub check: Mutex<MountResult>,
    pub failure: Mutex<Option<MountResult>>,
    pub mounts: Mutex<Vec<Arc<Mount>>>,
    pub sessions: Mutex<Vec<Arc<TestSession>>>,
    /// Sessions started while set ignore `stop`.
    pub stubborn: AtomicBool,
}

impl TestPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            check: Mutex::new(MountResult::Success),
            failure: Mutex::new(None),
            mounts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            stubborn: AtomicBool::new(false),
        })
    }

    /// The most recently mounted mount.
    pub fn last(&self) -> Arc<Mount> {
        Arc::clone(self.mounts.lock().last().expect("nothing mounted"))
    }
}

impl MountPlatform for TestPlatform {
    fn check(&self, _path: &NormalizedPath) -> MountResult {
        *self.check.lock()
    }

    fn mount(&self, mount: Arc<Mount>) -> Result<Arc<dyn MountSession>, MountResult> {
        if let Some(result) = *self.failure.lock() {
            return Err(result);
        }
        self.mounts.lock().push(mount);
        let session = if self.stubborn.load(Ordering::SeqCst) {
            Arc::new(TestSession::stubborn())
        } else {
            Arc::new(TestSession::default())
        };
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

pub fn flags() -> ServiceFlags {
    ServiceFlags::default()
        .with_inode_cache(
            InodeCacheFlags::default()
                .with_clean_interval(Duration::from_secs(3600))
                .with_clean_age_threshold(Duration::from_secs(3600)),
        )
        .with_file_service(
            FileServiceOptions::default()
                .with_minimum_range_distance(0)
                .with_minimum_range_size(1)
                .with_range_retries(3, Duration::from_millis(10)),
        )
        .with_flush_delay(Duration::from_millis(50))
        .with_disable_timeout(Duration::from_secs(10))
}

pub struct Fixture {
    pub flags: ServiceFlags,
    pub client: Arc<MockClient>,
    pub platform: Arc<TestPlatform>,
    pub service: Service,
    pub aborts: Arc<AtomicUsize>,
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_flags(flags())
    }

    pub fn with_flags(flags: ServiceFlags) -> Self {
        init_tracing();
        let client = MockClient::new();
        let dir = tempfile::tempdir().unwrap();
        let platform = TestPlatform::new();
        let aborts = Arc::new(AtomicUsize::new(0));
        let service = start(&client, &platform, &dir, &aborts, flags.clone());
        Self {
            flags,
            client,
            platform,
            service,
            aborts,
            dir,
        }
    }

    /// Stops the service and starts a new one over the same state.
    pub fn restart(self) -> Self {
        let Self {
            flags,
            client,
            platform,
            service,
            aborts,
            dir,
        } = self;
        platform.mounts.lock().clear();
        drop(service);
        let service = start(&client, &platform, &dir, &aborts, flags.clone());
        Self {
            flags,
            client,
            platform,
            service,
            aborts,
            dir,
        }
    }

    pub fn mount_path(&self, name: &str) -> NormalizedPath {
        NormalizedPath::new(self.dir.path().join("mnt").join(name))
    }

    pub fn aborted(&self) -> bool {
        self.aborts.load(Ordering::SeqCst) > 0
    }
}

fn start(
    client: &Arc<MockClient>,
    platform: &Arc<TestPlatform>,
    dir: &TempDir,
    aborts: &Arc<AtomicUsize>,
    flags: ServiceFlags,
) -> Service {
    let aborts = Arc::clone(aborts);
    Service::with_abort_handler(
        Arc::clone(client) as Arc<dyn nimbus_core::Client>,
        Arc::clone(platform) as Arc<dyn MountPlatform>,
        dir.path().join("state"),
        flags,
        Arc::new(move |_label: &str| {
            aborts.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap()
}

pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

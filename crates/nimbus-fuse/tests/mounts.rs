//! Mount lifecycle, validation and persistence.

mod common;

use common::{Fixture, wait_until};
use crossbeam_channel::Receiver;
use nimbus_core::{MountInodeID, NodeHandle};
use nimbus_fuse::{MountEvent, MountEventType, MountFlags, MountInfo, MountResult, MountState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn next(events: &Receiver<MountEvent>) -> MountEvent {
    events
        .recv_timeout(Duration::from_secs(5))
        .expect("no mount event")
}

fn event(name: &str, event_type: MountEventType, result: MountResult) -> MountEvent {
    MountEvent {
        name: name.to_string(),
        result,
        event_type,
    }
}

fn docs(fixture: &Fixture, flags: MountFlags) -> MountInfo {
    let handle = fixture.client.add_directory(fixture.client.root(), "docs");
    MountInfo::new(flags, handle, fixture.mount_path("docs"))
}

#[test]
fn test_add_enable_disable() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let events = mounts.subscribe();
    let info = docs(&fixture, MountFlags::new("x"));

    assert_eq!(mounts.add(info.clone()), MountResult::Success);
    assert_eq!(mounts.state("x"), Some(MountState::Disabled));
    assert_eq!(next(&events), event("x", MountEventType::Added, MountResult::Success));

    assert_eq!(mounts.enable("x", false), MountResult::Success);
    assert_eq!(mounts.state("x"), Some(MountState::Enabled));
    assert!(mounts.enabled("x"));
    assert_eq!(next(&events), event("x", MountEventType::Enabled, MountResult::Success));

    let mount = mounts.get("x").unwrap();
    assert_eq!(mount.info(), info);
    assert!(Arc::ptr_eq(&mount, &fixture.platform.last()));
    drop(mount);

    assert_eq!(mounts.disable("x", false), MountResult::Success);
    assert_eq!(mounts.state("x"), Some(MountState::Disabled));
    assert!(mounts.get("x").is_none());
    assert_eq!(next(&events), event("x", MountEventType::Disabled, MountResult::Success));
    assert!(!fixture.aborted());
}

#[test]
fn test_add_validates_in_order() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let file = fixture.client.add_file(fixture.client.root(), "file", Vec::new());
    let info = docs(&fixture, MountFlags::new("docs"));

    let unknown = MountInfo::new(MountFlags::new(""), NodeHandle::new(999_999), "/mnt/a");
    assert_eq!(mounts.add(unknown), MountResult::RemoteUnknown);

    let unnamed = MountInfo::new(MountFlags::new(""), info.handle, "/mnt/a");
    assert_eq!(mounts.add(unnamed), MountResult::NoName);

    let on_file = MountInfo::new(MountFlags::new("file"), file, "/mnt/a");
    assert_eq!(mounts.add(on_file), MountResult::RemoteFile);

    *fixture.platform.check.lock() = MountResult::LocalUnknown;
    assert_eq!(mounts.add(info.clone()), MountResult::LocalUnknown);
    *fixture.platform.check.lock() = MountResult::Success;

    assert_eq!(mounts.add(info.clone()), MountResult::Success);

    let nested = MountInfo::new(
        MountFlags::new("nested"),
        info.handle,
        info.path.as_path().join("inner"),
    );
    assert_eq!(mounts.add(nested), MountResult::LocalTaken);

    let same_name = MountInfo::new(MountFlags::new("docs"), info.handle, fixture.mount_path("other"));
    assert_eq!(mounts.add(same_name), MountResult::NameTaken);
    assert_eq!(mounts.mounts(), vec![info]);
}

#[test]
fn test_state_violations_are_rejected() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    assert_eq!(mounts.enable("missing", false), MountResult::Unknown);
    assert_eq!(mounts.disable("missing", false), MountResult::Unknown);
    assert_eq!(mounts.remove("missing"), MountResult::Unknown);

    mounts.add(docs(&fixture, MountFlags::new("docs")));
    assert_eq!(mounts.disable("docs", false), MountResult::Busy);
    assert_eq!(mounts.enable("docs", false), MountResult::Success);
    assert_eq!(mounts.enable("docs", false), MountResult::Busy);
    assert_eq!(mounts.remove("docs"), MountResult::Busy);

    let events = mounts.subscribe();
    assert_eq!(mounts.disable("docs", false), MountResult::Success);
    assert_eq!(mounts.remove("docs"), MountResult::Success);
    assert_eq!(mounts.state("docs"), None);
    assert_eq!(next(&events).event_type, MountEventType::Disabled);
    assert_eq!(next(&events), event("docs", MountEventType::Removed, MountResult::Success));
}

#[test]
fn test_platform_failure_reverts_to_disabled() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let events = mounts.subscribe();
    mounts.add(docs(&fixture, MountFlags::new("docs")));
    next(&events);

    *fixture.platform.failure.lock() = Some(MountResult::Unsupported);
    assert_eq!(mounts.enable("docs", false), MountResult::Unsupported);
    assert_eq!(mounts.state("docs"), Some(MountState::Disabled));
    assert_eq!(
        next(&events),
        event("docs", MountEventType::Enabled, MountResult::Unsupported)
    );

    *fixture.platform.failure.lock() = None;
    assert_eq!(mounts.enable("docs", false), MountResult::Success);
}

#[test]
fn test_enable_at_startup_enables_on_add() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let events = mounts.subscribe();

    let info = docs(&fixture, MountFlags::new("docs").with_enable_at_startup(true));
    assert_eq!(mounts.add(info), MountResult::Success);
    assert!(mounts.enabled("docs"));
    assert_eq!(next(&events).event_type, MountEventType::Added);
    assert_eq!(next(&events).event_type, MountEventType::Enabled);
}

#[test]
fn test_disable_waits_for_open_contexts() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    mounts.add(docs(&fixture, MountFlags::new("docs")));
    mounts.enable("docs", false);

    let mount = mounts.get("docs").unwrap();
    let directory = mount.directory(MountInodeID::ROOT).unwrap();
    assert_eq!(mount.activity(), 1);

    let closed = Arc::new(AtomicBool::new(false));
    let closer = {
        let closed = Arc::clone(&closed);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            closed.store(true, Ordering::SeqCst);
            drop(directory);
        })
    };

    assert_eq!(mounts.disable("docs", false), MountResult::Success);
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(mount.activity(), 0);
    closer.join().unwrap();
    assert!(!fixture.aborted());
}

#[test]
fn test_disable_gives_up_on_session_ignoring_stop() {
    let fixture = Fixture::new();
    let flags = fixture.service.flags();
    fixture
        .service
        .set_flags(flags.with_disable_timeout(Duration::from_millis(100)));
    fixture.platform.stubborn.store(true, Ordering::SeqCst);

    let mounts = fixture.service.mounts();
    mounts.add(docs(&fixture, MountFlags::new("docs")));
    assert_eq!(mounts.enable("docs", false), MountResult::Success);

    let started = Instant::now();
    assert_eq!(mounts.disable("docs", false), MountResult::Success);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(mounts.state("docs"), Some(MountState::Disabled));
    wait_until(|| fixture.aborted());

    for session in fixture.platform.sessions.lock().iter() {
        session.release();
    }
}

#[test]
fn test_persistent_mounts_survive_restart() {
    let fixture = Fixture::new();
    let persistent = docs(
        &fixture,
        MountFlags::new("docs")
            .with_persistent(true)
            .with_read_only(true),
    );
    let photos = fixture.client.add_directory(fixture.client.root(), "photos");
    let transient = MountInfo::new(MountFlags::new("photos"), photos, fixture.mount_path("photos"));

    let mounts = fixture.service.mounts();
    assert!(mounts.add(persistent.clone()).is_success());
    assert!(mounts.add(transient).is_success());
    assert!(mounts.enable("docs", true).is_success());

    let fixture = fixture.restart();
    let mounts = fixture.service.mounts();
    let mut expected = persistent;
    expected.flags.enable_at_startup = true;
    assert_eq!(mounts.mounts(), vec![expected.clone()]);
    assert_eq!(mounts.info("docs"), Some(expected));
    assert_eq!(mounts.state("docs"), Some(MountState::Disabled));

    let results = mounts.enable_at_startup();
    assert_eq!(results, vec![("docs".to_string(), MountResult::Success)]);
    assert!(mounts.get("docs").unwrap().read_only());
}

#[test]
fn test_disable_remember_clears_enable_at_startup() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    mounts.add(docs(&fixture, MountFlags::new("docs").with_persistent(true)));
    mounts.enable("docs", true);
    assert!(mounts.info("docs").unwrap().flags.enable_at_startup);

    mounts.disable("docs", true);
    assert!(!mounts.info("docs").unwrap().flags.enable_at_startup);

    let fixture = fixture.restart();
    let mounts = fixture.service.mounts();
    assert!(!mounts.info("docs").unwrap().flags.enable_at_startup);
    assert!(mounts.enable_at_startup().is_empty());
}

#[test]
fn test_set_flags_renames() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let photos = fixture.client.add_directory(fixture.client.root(), "photos");
    mounts.add(docs(&fixture, MountFlags::new("docs").with_persistent(true)));
    mounts.add(MountInfo::new(MountFlags::new("photos"), photos, fixture.mount_path("photos")));
    mounts.enable("docs", false);
    let events = mounts.subscribe();

    assert_eq!(mounts.set_flags("docs", MountFlags::new("photos")), MountResult::NameTaken);
    assert_eq!(mounts.set_flags("docs", MountFlags::new("")), MountResult::NoName);
    assert_eq!(mounts.set_flags("missing", MountFlags::new("x")), MountResult::Unknown);

    let renamed = MountFlags::new("papers").with_persistent(true);
    assert_eq!(mounts.set_flags("docs", renamed.clone()), MountResult::Success);
    assert_eq!(next(&events), event("papers", MountEventType::Changed, MountResult::Success));
    assert_eq!(mounts.state("docs"), None);
    assert_eq!(mounts.info("papers").unwrap().flags, renamed);
    assert_eq!(mounts.get("papers").unwrap().name(), "papers");

    mounts.disable("papers", false);
    let fixture = fixture.restart();
    let names: Vec<String> = fixture
        .service
        .mounts()
        .mounts()
        .into_iter()
        .map(|info| info.flags.name)
        .collect();
    assert_eq!(names, ["papers"]);
}

#[test]
fn test_prune_forgets_transient_mounts() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    let photos = fixture.client.add_directory(fixture.client.root(), "photos");
    mounts.add(docs(&fixture, MountFlags::new("docs").with_persistent(true)));
    mounts.add(MountInfo::new(MountFlags::new("photos"), photos, fixture.mount_path("photos")));

    assert_eq!(mounts.prune(), 1);
    assert!(mounts.info("photos").is_none());
    assert!(mounts.info("docs").is_some());
}

#[test]
fn test_shutdown_disables_mounts() {
    let fixture = Fixture::new();
    let mounts = fixture.service.mounts();
    mounts.add(docs(&fixture, MountFlags::new("docs")));
    mounts.enable("docs", false);
    let events = mounts.subscribe();

    fixture.service.shutdown();
    assert_eq!(mounts.state("docs"), Some(MountState::Disabled));
    wait_until(|| events.try_recv().is_ok_and(|e| e.event_type == MountEventType::Disabled));
}

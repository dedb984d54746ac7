//! Directory and file contexts of an enabled mount.

mod common;

use common::{Fixture, wait_until};
use nimbus_core::{Client, InodeID, MountInodeID, NodeHandle, TaskExecutorFlags};
use nimbus_fuse::{FuseError, Mount, MountFlags, MountInfo, ServiceFlags};
use std::sync::Arc;

struct Mounted {
    fixture: Fixture,
    root: NodeHandle,
    mount: Arc<Mount>,
}

fn mounted(read_only: bool) -> Mounted {
    mounted_with(read_only, common::flags())
}

fn mounted_with(read_only: bool, flags: ServiceFlags) -> Mounted {
    let fixture = Fixture::with_flags(flags);
    let root = fixture.client.add_directory(fixture.client.root(), "docs");
    let info = MountInfo::new(
        MountFlags::new("docs").with_read_only(read_only),
        root,
        fixture.mount_path("docs"),
    );
    let mounts = fixture.service.mounts();
    assert!(mounts.add(info).is_success());
    assert!(mounts.enable("docs", false).is_success());
    let mount = mounts.get("docs").unwrap();
    Mounted {
        fixture,
        root,
        mount,
    }
}

#[test]
fn test_directory_listing_and_lookup() {
    let m = mounted(false);
    let client = &m.fixture.client;
    let notes = client.add_file(m.root, "notes.txt", b"hello".to_vec());
    client.add_directory(m.root, "archive");

    let root = m.mount.directory(MountInodeID::ROOT).unwrap();
    assert_eq!(root.id(), MountInodeID::ROOT);
    assert!(root.attributes().is_directory);

    let entries = root.entries().unwrap();
    let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, ["archive", "notes.txt"]);

    let attributes = root.lookup("notes.txt").unwrap();
    assert!(!attributes.is_directory);
    assert_eq!(attributes.size, 5);
    assert_eq!(attributes, entries[1].1);
    assert_eq!(m.mount.attributes(attributes.id).unwrap(), attributes);
    assert_ne!(attributes.id.as_u64(), InodeID::from_handle(notes).as_u64());

    assert!(matches!(root.lookup("missing"), Err(FuseError::NotFound)));
    assert!(matches!(m.mount.directory(attributes.id), Err(FuseError::NotDirectory)));
    assert!(matches!(m.mount.open(MountInodeID::ROOT), Err(FuseError::IsDirectory)));
}

#[test]
fn test_read_remote_file() {
    let m = mounted(false);
    m.fixture.client.add_file(m.root, "notes.txt", b"hello world".to_vec());
    let id = m.mount.lookup(MountInodeID::ROOT, "notes.txt").unwrap().id;

    let file = m.mount.open(id).unwrap();
    assert_eq!(&file.read(6, 100).unwrap()[..], b"world");
    assert_eq!(&file.read(0, 5).unwrap()[..], b"hello");
    assert!(file.read(11, 10).unwrap().is_empty());
}

#[test]
fn test_create_write_and_flush() {
    let m = mounted(false);
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();

    let file = root.create_file("new.txt").unwrap();
    assert_eq!(file.write(0, b"fresh content").unwrap(), 13);
    assert_eq!(file.attributes().size, 13);
    assert!(matches!(root.create_file("new.txt"), Err(FuseError::Exists)));
    assert_eq!(root.entries().unwrap().len(), 1);

    file.flush().unwrap();
    let node = m.fixture.client.lookup(m.root, "new.txt").unwrap();
    assert_eq!(m.fixture.client.content(node.handle).unwrap(), b"fresh content");

    m.fixture.service.sync();
    let attributes = root.lookup("new.txt").unwrap();
    assert_eq!(attributes.id, file.id());
    assert_eq!(attributes.size, 13);
    assert_eq!(m.fixture.client.upload_count(), 1);
}

#[test]
fn test_closing_a_modified_file_flushes_later() {
    let m = mounted(false);
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();

    let file = root.create_file("later.txt").unwrap();
    file.write(0, b"eventually").unwrap();
    drop(file);

    let client = Arc::clone(&m.fixture.client);
    let root_handle = m.root;
    wait_until(|| {
        client
            .lookup(root_handle, "later.txt")
            .is_ok_and(|node| client.content(node.handle).as_deref() == Some(&b"eventually"[..]))
    });
}

#[test]
fn test_delayed_flush_completes_on_a_single_worker() {
    let flags = common::flags().with_executor(TaskExecutorFlags::default().with_max_workers(1));
    let m = mounted_with(false, flags);
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();

    let file = root.create_file("single.txt").unwrap();
    file.write(0, b"eventually").unwrap();
    let file_id = file.file().id();
    drop(file);

    let client = Arc::clone(&m.fixture.client);
    let root_handle = m.root;
    wait_until(|| {
        client
            .lookup(root_handle, "single.txt")
            .is_ok_and(|node| client.content(node.handle).as_deref() == Some(&b"eventually"[..]))
    });
    let files = m.fixture.service.file_service();
    wait_until(|| files.info(file_id).is_ok_and(|info| !info.dirty));
    assert_eq!(client.upload_count(), 1);
    assert_eq!(root.lookup("single.txt").unwrap().size, 10);
}

#[test]
fn test_write_to_existing_file() {
    let m = mounted(false);
    let handle = m.fixture.client.add_file(m.root, "notes.txt", b"hello world".to_vec());
    let id = m.mount.lookup(MountInodeID::ROOT, "notes.txt").unwrap().id;

    let file = m.mount.open(id).unwrap();
    file.write(0, b"HELLO").unwrap();
    file.truncate(8).unwrap();
    assert_eq!(&file.read(0, 100).unwrap()[..], b"HELLO wo");
    file.flush().unwrap();
    assert_eq!(m.fixture.client.content(handle).unwrap(), b"HELLO wo");
}

#[test]
fn test_read_only_mount_refuses_changes() {
    let m = mounted(true);
    m.fixture.client.add_file(m.root, "notes.txt", b"hello".to_vec());
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();
    assert!(root.attributes().read_only);

    assert!(matches!(root.make_directory("new"), Err(FuseError::ReadOnly)));
    assert!(matches!(root.create_file("new.txt"), Err(FuseError::ReadOnly)));
    assert!(matches!(root.remove("notes.txt"), Err(FuseError::ReadOnly)));

    let id = root.lookup("notes.txt").unwrap().id;
    let file = m.mount.open(id).unwrap();
    assert!(matches!(file.write(0, b"x"), Err(FuseError::ReadOnly)));
    assert!(matches!(file.truncate(0), Err(FuseError::ReadOnly)));
    assert_eq!(&file.read(0, 5).unwrap()[..], b"hello");
}

#[test]
fn test_make_directory_and_remove() {
    let m = mounted(false);
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();
    let notes = m.fixture.client.add_file(m.root, "notes.txt", b"hello".to_vec());

    let created = root.make_directory("sub").unwrap();
    assert!(created.is_directory);
    assert!(m.fixture.client.lookup(m.root, "sub").is_ok());

    let sub = m.mount.directory(created.id).unwrap();
    sub.make_directory("inner").unwrap();
    assert!(matches!(root.remove("sub"), Err(FuseError::NotEmpty)));
    sub.remove("inner").unwrap();
    root.remove("sub").unwrap();

    let id = root.lookup("notes.txt").unwrap().id;
    drop(m.mount.open(id).unwrap());
    root.remove("notes.txt").unwrap();
    assert!(!m.fixture.client.exists(notes));
    assert!(matches!(root.lookup("notes.txt"), Err(FuseError::NotFound)));
    assert!(matches!(m.mount.attributes(id), Err(FuseError::NotFound)));
}

#[test]
fn test_rename_unflushed_file() {
    let m = mounted(false);
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();
    let created = root.make_directory("sub").unwrap();

    let file = root.create_file("draft.txt").unwrap();
    file.write(0, b"draft").unwrap();
    root.rename("draft.txt", created.id, "final.txt").unwrap();
    assert!(matches!(root.lookup("draft.txt"), Err(FuseError::NotFound)));

    file.flush().unwrap();
    let sub = m.fixture.client.lookup(m.root, "sub").unwrap();
    let node = m.fixture.client.lookup(sub.handle, "final.txt").unwrap();
    assert_eq!(m.fixture.client.content(node.handle).unwrap(), b"draft");
}

#[test]
fn test_rename_bound_file() {
    let m = mounted(false);
    let handle = m.fixture.client.add_file(m.root, "a.txt", b"a".to_vec());
    m.fixture.client.add_file(m.root, "taken.txt", Vec::new());
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();

    assert!(matches!(root.rename("a.txt", MountInodeID::ROOT, "taken.txt"), Err(FuseError::Exists)));
    root.rename("a.txt", MountInodeID::ROOT, "b.txt").unwrap();
    assert_eq!(m.fixture.client.get(handle).unwrap().name, "b.txt");
    assert_eq!(root.lookup("b.txt").unwrap().size, 1);
}

#[test]
fn test_remote_changes_reach_open_mounts() {
    let m = mounted(false);
    let client = &m.fixture.client;
    let notes = client.add_file(m.root, "notes.txt", b"hello".to_vec());
    let doomed = client.add_file(m.root, "doomed.txt", Vec::new());
    let root = m.mount.directory(MountInodeID::ROOT).unwrap();

    let id = root.lookup("notes.txt").unwrap().id;
    assert_eq!(&m.mount.open(id).unwrap().read(0, 5).unwrap()[..], b"hello");
    root.lookup("doomed.txt").unwrap();

    client.set_content(notes, b"changed remotely".to_vec()).unwrap();
    client.remove(doomed).unwrap();
    m.fixture.service.sync();

    assert_eq!(root.lookup("notes.txt").unwrap().size, 16);
    assert_eq!(
        &m.mount.open(id).unwrap().read(0, 100).unwrap()[..],
        b"changed remotely"
    );
    assert!(matches!(root.lookup("doomed.txt"), Err(FuseError::NotFound)));
}

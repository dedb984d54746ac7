//! Inode lifetime as seen through a running service.

mod common;

use common::Fixture;
use nimbus_core::{Client, InodeID};
use nimbus_fuse::{FuseError, InodeCacheFlags};
use proptest::prelude::*;

#[test]
fn test_remote_removal_tombstones_held_inode() {
    let f = Fixture::new();
    let docs = f.client.add_directory(f.client.root(), "docs");
    let report = f.client.add_file(docs, "report.txt", b"draft".to_vec());

    let inode_db = f.service.inode_db();
    let root = inode_db.root(f.client.root()).unwrap();
    let inode = inode_db.get(InodeID::from_handle(report)).unwrap();
    let id = inode.id();
    inode_db.clear_cache();

    f.client.remove(docs).unwrap();
    f.service.sync();

    assert!(inode.removed());
    assert!(inode_db.in_memory(id));
    assert!(matches!(inode_db.get(id), Err(FuseError::NotFound)));
    assert!(matches!(inode_db.lookup(&root, "docs"), Err(FuseError::NotFound)));

    drop(inode);
    assert!(!inode_db.in_memory(id));
    assert!(!inode_db.in_memory(InodeID::from_handle(docs)));
}

#[test]
fn test_discarded_events_leave_inodes_untouched() {
    let f = Fixture::new();
    let file = f.client.add_file(f.client.root(), "kept.txt", b"x".to_vec());
    let inode = f.service.inode_db().get(InodeID::from_handle(file)).unwrap();

    f.service.discard(true);
    f.client.remove(file).unwrap();
    f.service.sync();
    assert!(!inode.removed());

    f.service.discard(false);
}

#[test]
fn test_cache_limit_applies_through_service_flags() {
    let f = Fixture::new();
    let handles: Vec<_> = (0..8)
        .map(|i| f.client.add_file(f.client.root(), &format!("f{i}"), Vec::new()))
        .collect();

    let mut flags = f.service.flags();
    flags.inode_cache = InodeCacheFlags::default().with_max_size(3);
    f.service.set_flags(flags);

    let inode_db = f.service.inode_db();
    for handle in &handles {
        drop(inode_db.get(InodeID::from_handle(*handle)).unwrap());
    }
    assert!(inode_db.cache_size() <= 3);

    // The most recently used inodes survive.
    let last = InodeID::from_handle(handles[7]);
    assert!(inode_db.cached(last));
    assert!(inode_db.in_memory(last));
    assert!(!inode_db.in_memory(InodeID::from_handle(handles[0])));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_lookup_finds_every_remote_child(names in proptest::collection::btree_set("[a-z]{1,8}", 1..12)) {
        let f = Fixture::new();
        for name in &names {
            f.client.add_file(f.client.root(), name, name.as_bytes().to_vec());
        }
        let inode_db = f.service.inode_db();
        let root = inode_db.root(f.client.root()).unwrap();

        for name in &names {
            let inode = inode_db.lookup(&root, name).unwrap();
            prop_assert_eq!(inode.name(), name.clone());
            prop_assert_eq!(inode.info().size, name.len() as u64);
            prop_assert!(inode.is_bound());
        }

        let listed: Vec<String> = inode_db.children(&root).unwrap().iter().map(|c| c.name()).collect();
        prop_assert_eq!(listed, names.iter().cloned().collect::<Vec<_>>());
    }
}

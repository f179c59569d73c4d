// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use archfs_kernel::testing::{CallLog, RecordDriver};
use archfs_kernel::{
    AccessOptions, DriverRegistry, FsContext, FsError, FsManager, KernelConfig, MountPoint, NodeName, Scheme,
    SyncOptions,
};

fn manager_with(driver: RecordDriver) -> FsManager {
    let driver = Arc::new(driver);
    let drivers = DriverRegistry::new()
        .with("zip", driver.clone())
        .unwrap()
        .with("tar", driver)
        .unwrap();
    FsManager::new(FsContext::new(KernelConfig::default(), drivers))
}

fn manager() -> FsManager {
    manager_with(RecordDriver::new())
}

fn path(dir: &Path, rest: &str) -> String {
    format!("{}/{}", dir.display(), rest)
}

#[test]
fn equal_mount_points_share_one_controller() {
    let manager = manager();
    let first = manager
        .controller(&MountPoint::parse("zip:file:/tmp/a.zip!/").unwrap())
        .unwrap();
    let root = Arc::new(MountPoint::platform("/").unwrap());
    let nested = MountPoint::nested(Scheme::new("zip").unwrap(), root, &NodeName::new("tmp/a.zip").unwrap()).unwrap();
    let second = manager.controller(&nested).unwrap();
    let (third, _) = manager.resolve("/tmp/a.zip/readme.txt").unwrap();
    assert!(std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));
    assert!(std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&third)));
    assert_eq!(manager.len(), 2);
    assert_eq!(
        manager
            .mount_points()
            .iter()
            .map(|mp| mp.to_string())
            .collect::<Vec<_>>(),
        vec!["file:/tmp/", "zip:file:/tmp/a.zip!/"]
    );
}

#[test]
fn nested_path_resolves_one_chain_per_level() {
    let manager = manager();
    let (controller, node_path) = manager.resolve("/data/outer.zip/inner.tar/readme.txt").unwrap();
    assert_eq!(node_path.levels(), 3);
    assert_eq!(node_path.name.as_str(), "readme.txt");
    assert_eq!(controller.mount_point().to_string(), "tar:zip:file:/data/outer.zip!/inner.tar!/");
    let parent = controller.parent().unwrap();
    assert_eq!(parent.mount_point().to_string(), "zip:file:/data/outer.zip!/");
    assert!(parent.parent().unwrap().parent().is_none());
    assert_eq!(manager.len(), 3);
}

#[test]
fn unknown_archive_scheme_is_rejected() {
    let manager = manager();
    let err = manager
        .controller(&MountPoint::parse("rar:file:/tmp/a.rar!/").unwrap())
        .err()
        .unwrap();
    assert!(matches!(err, FsError::UnknownScheme(_)));
}

#[test]
fn write_sync_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let archive = path(dir.path(), "a.zip/docs/hello.txt");
    {
        let manager = manager();
        manager.write(&archive, b"hello").unwrap();
        assert_eq!(manager.read(&archive).unwrap(), b"hello");
        manager.sync_all(SyncOptions::sync()).unwrap();
        assert!(manager.is_empty());
    }
    assert!(dir.path().join("a.zip").is_file());

    let manager = manager();
    assert_eq!(manager.read(&archive).unwrap(), b"hello");
    let listing = manager.list(&path(dir.path(), "a.zip/docs")).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name.as_str(), "docs/hello.txt");
    assert_eq!(listing[0].size, Some(5));
    assert!(manager.stat(&path(dir.path(), "a.zip/missing")).unwrap().is_none());
}

#[test]
fn rewriting_an_entry_syncs_transparently() {
    let dir = tempfile::tempdir().unwrap();
    let entry = path(dir.path(), "a.zip/a");
    let manager = manager();
    manager.write(&entry, b"first").unwrap();
    manager.write(&entry, b"second").unwrap();
    assert_eq!(manager.read(&entry).unwrap(), b"second");
    manager.sync_all(SyncOptions::sync()).unwrap();
    drop(manager);

    let manager = self::manager();
    assert_eq!(manager.read(&entry).unwrap(), b"second");
}

#[test]
fn untouched_entries_survive_an_update() {
    let dir = tempfile::tempdir().unwrap();
    let seed = RecordDriver::encode(&[
        ("keep.txt", Some(b"kept".as_slice())),
        ("dir", None),
        ("dir/old.txt", Some(b"old".as_slice())),
    ])
    .unwrap();
    std::fs::write(dir.path().join("a.zip"), seed).unwrap();

    let manager = manager();
    manager.write(&path(dir.path(), "a.zip/dir/old.txt"), b"new").unwrap();
    manager.remove(&path(dir.path(), "a.zip/keep.txt")).unwrap();
    manager.mkdir(&path(dir.path(), "a.zip/empty")).unwrap();
    manager.sync_all(SyncOptions::sync()).unwrap();

    let names: Vec<String> = manager
        .list(&path(dir.path(), "a.zip"))
        .unwrap()
        .into_iter()
        .map(|entry| entry.name.to_string())
        .collect();
    assert_eq!(names, vec!["dir", "empty"]);
    assert_eq!(manager.read(&path(dir.path(), "a.zip/dir/old.txt")).unwrap(), b"new");
}

#[test]
fn sync_all_visits_children_before_parents() {
    let dir = tempfile::tempdir().unwrap();
    let log = CallLog::default();
    let manager = manager_with(RecordDriver::new().with_call_log(log.clone()));
    let readme = path(dir.path(), "outer.zip/inner.tar/readme.txt");
    manager.write(&readme, b"nested").unwrap();

    let order: Vec<String> = manager
        .sync_order()
        .iter()
        .map(|controller| controller.mount_point().to_string())
        .collect();
    assert_eq!(order.len(), 3);
    assert!(order[0].starts_with("tar:zip:file:"));
    assert!(order[1].starts_with("zip:file:"));
    assert!(order[2].starts_with("file:"));

    log.clear();
    manager.sync_all(SyncOptions::sync()).unwrap();
    let synced = log.mount_points("sync");
    assert_eq!(synced, order[..2].to_vec());
    assert!(manager.is_empty());

    let fresh = self::manager();
    assert_eq!(fresh.read(&readme).unwrap(), b"nested");
}

#[test]
fn open_streams_make_a_sync_fail_but_not_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager();
    manager.write(&path(dir.path(), "b.zip/done"), b"done").unwrap();
    let (controller, node_path) = manager.resolve(&path(dir.path(), "a.zip/open")).unwrap();
    let mut open = controller
        .output(AccessOptions::default(), &node_path.name, None)
        .unwrap();
    open.write_all(b"pending").unwrap();

    let err = manager.sync_all(SyncOptions::sync()).unwrap_err();
    let aggregate = match err {
        FsError::SyncAggregate(aggregate) => aggregate,
        other => panic!("expected an aggregate, got {other}"),
    };
    assert_eq!(aggregate.failures().len(), 1);
    assert!(matches!(aggregate.failures()[0].error, FsError::Busy(_)));
    assert!(!aggregate.is_warning_only());
    assert!(dir.path().join("b.zip").is_file());

    open.close().unwrap();
    drop(open);
    manager.sync_all(SyncOptions::sync()).unwrap();
    assert_eq!(manager.read(&path(dir.path(), "a.zip/open")).unwrap(), b"pending");
}

#[test]
fn forced_unmount_closes_streams_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager();
    let (controller, node_path) = manager.resolve(&path(dir.path(), "a.zip/open")).unwrap();
    let mut open = controller
        .output(AccessOptions::default(), &node_path.name, None)
        .unwrap();
    open.write_all(b"pending").unwrap();
    drop(controller);

    let err = manager
        .sync_all(SyncOptions::umount(std::time::Duration::from_millis(10)))
        .unwrap_err();
    assert!(err.is_warning(), "{err}");
    assert!(open.write_all(b"more").is_err());
}

#[test]
fn removing_an_empty_archive_deletes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.zip"), RecordDriver::encode(&[]).unwrap()).unwrap();
    let manager = manager();
    let (controller, _) = manager.resolve(&path(dir.path(), "a.zip")).unwrap();
    controller.unlink(AccessOptions::default(), &NodeName::root()).unwrap();
    assert!(!dir.path().join("a.zip").exists());
}

#[test]
fn plain_files_are_not_archives() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.zip"), b"not a record archive").unwrap();
    let manager = manager();
    let err = manager.read(&path(dir.path(), "a.zip/x")).unwrap_err();
    assert!(matches!(err, FsError::NotAnArchive(_)), "{err}");
}

#[test]
fn dropped_output_keeps_the_previous_entry() {
    let dir = tempfile::tempdir().unwrap();
    let entry = path(dir.path(), "a.zip/entry");
    let manager = manager();
    manager.write(&entry, b"original").unwrap();
    manager.sync_all(SyncOptions::sync()).unwrap();

    let (controller, node_path) = manager.resolve(&entry).unwrap();
    let mut abandoned = controller
        .output(AccessOptions::default(), &node_path.name, None)
        .unwrap();
    abandoned.write_all(b"partial").unwrap();
    drop(abandoned);

    let (fresh, fresh_path) = manager.resolve(&path(dir.path(), "a.zip/fresh")).unwrap();
    let mut never_closed = fresh.output(AccessOptions::default(), &fresh_path.name, None).unwrap();
    never_closed.write_all(b"gone").unwrap();
    drop(never_closed);
    drop((controller, fresh));

    let stat = manager.stat(&entry).unwrap().unwrap();
    assert_eq!(stat.size, Some(8));
    assert_eq!(manager.read(&entry).unwrap(), b"original");
    assert!(manager.stat(&path(dir.path(), "a.zip/fresh")).unwrap().is_none());
    manager.sync_all(SyncOptions::sync()).unwrap();
    drop(manager);

    let manager = self::manager();
    assert_eq!(manager.read(&entry).unwrap(), b"original");
    assert!(manager.stat(&path(dir.path(), "a.zip/fresh")).unwrap().is_none());
}

#[test]
fn read_only_archives_refuse_changes() {
    let dir = tempfile::tempdir().unwrap();
    let seed = RecordDriver::encode(&[("keep.txt", Some(b"kept".as_slice()))]).unwrap();
    std::fs::write(dir.path().join("a.zip"), &seed).unwrap();
    let manager = manager_with(RecordDriver::new().read_only());

    assert_eq!(manager.read(&path(dir.path(), "a.zip/keep.txt")).unwrap(), b"kept");
    let refused = [
        manager.write(&path(dir.path(), "a.zip/new.txt"), b"new"),
        manager.mkdir(&path(dir.path(), "a.zip/dir")),
        manager.remove(&path(dir.path(), "a.zip/keep.txt")),
    ];
    for result in refused {
        assert!(matches!(result, Err(FsError::ReadOnlyFileSystem(_))), "{result:?}");
    }
    manager.sync_all(SyncOptions::sync()).unwrap();
    assert_eq!(std::fs::read(dir.path().join("a.zip")).unwrap(), seed);
}

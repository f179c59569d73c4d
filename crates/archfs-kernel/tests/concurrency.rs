// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use archfs_kernel::testing::RecordDriver;
use archfs_kernel::{AccessOptions, DriverRegistry, FsContext, FsError, FsManager, FsResult, KernelConfig, SyncOptions};

fn manager() -> FsManager {
    let driver = Arc::new(RecordDriver::new());
    let drivers = DriverRegistry::new()
        .with("zip", driver.clone())
        .unwrap()
        .with("tar", driver)
        .unwrap();
    FsManager::new(FsContext::new(KernelConfig::default(), drivers))
}

fn path(dir: &Path, rest: &str) -> String {
    format!("{}/{}", dir.display(), rest)
}

/// A sync racing with writers may only report busy mount points.
fn assert_busy_at_most(result: FsResult<()>) {
    match result {
        Ok(()) => {}
        Err(FsError::SyncAggregate(aggregate)) => {
            for failure in aggregate.failures() {
                assert!(
                    matches!(failure.error, FsError::Busy(_)),
                    "{}: {}",
                    failure.mount_point,
                    failure.error
                );
            }
        }
        Err(other) => panic!("unexpected sync error: {other}"),
    }
}

#[test]
fn acknowledged_writes_survive_concurrent_syncs() {
    let dir = tempfile::tempdir().unwrap();
    let root: PathBuf = dir.path().to_path_buf();
    let manager = Arc::new(manager());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        let root = root.clone();
        thread::spawn(move || {
            for i in 0..40 {
                let entry = path(&root, &format!("a.zip/f{i}"));
                manager.write(&entry, format!("value {i}").as_bytes()).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };
    let syncer = {
        let manager = Arc::clone(&manager);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut rounds = 0;
            while !done.load(Ordering::SeqCst) {
                assert_busy_at_most(manager.sync_all(SyncOptions::sync()));
                rounds += 1;
                thread::yield_now();
            }
            rounds
        })
    };

    writer.join().unwrap();
    assert!(syncer.join().unwrap() > 0);
    manager.sync_all(SyncOptions::sync()).unwrap();
    drop(manager);

    let manager = self::manager();
    for i in 0..40 {
        let entry = path(&root, &format!("a.zip/f{i}"));
        assert_eq!(manager.read(&entry).unwrap(), format!("value {i}").into_bytes(), "f{i}");
    }
}

#[test]
fn waiting_sync_lets_another_thread_finish_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let manager = Arc::new(manager());
    manager.write(&path(&root, "a.zip/first"), b"first").unwrap();

    let (opened_tx, opened_rx) = mpsc::channel();
    let writer = {
        let manager = Arc::clone(&manager);
        let root = root.clone();
        thread::spawn(move || {
            let (controller, node_path) = manager.resolve(&path(&root, "a.zip/second")).unwrap();
            let mut out = controller
                .output(AccessOptions::default(), &node_path.name, None)
                .unwrap();
            out.write_all(b"sec").unwrap();
            opened_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
            out.write_all(b"ond").unwrap();
            out.close().unwrap();
        })
    };
    opened_rx.recv().unwrap();

    assert_busy_at_most(manager.sync_all(SyncOptions::sync()));
    manager.sync_all(SyncOptions::waiting(Duration::from_secs(5))).unwrap();
    writer.join().unwrap();
    drop(manager);

    let manager = self::manager();
    assert_eq!(manager.read(&path(&root, "a.zip/first")).unwrap(), b"first");
    assert_eq!(manager.read(&path(&root, "a.zip/second")).unwrap(), b"second");
}

#[test]
fn readers_and_rewriters_share_a_nested_archive() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let inner = RecordDriver::encode(&[("seed.txt", Some(b"seed".as_slice()))]).unwrap();
    let outer = RecordDriver::encode(&[("inner.tar", Some(inner.as_slice()))]).unwrap();
    std::fs::write(root.join("outer.zip"), outer).unwrap();

    let manager = Arc::new(manager());
    let seed = path(&root, "outer.zip/inner.tar/seed.txt");
    let mut threads = Vec::new();
    for reader in 0..2 {
        let manager = Arc::clone(&manager);
        let seed = seed.clone();
        threads.push(thread::spawn(move || {
            for round in 0..20 {
                let data = manager.read(&seed).unwrap_or_else(|err| panic!("reader {reader} round {round}: {err}"));
                assert_eq!(data, b"seed");
            }
        }));
    }
    for writer in 0..2 {
        let manager = Arc::clone(&manager);
        let entry = path(&root, &format!("outer.zip/inner.tar/w{writer}"));
        threads.push(thread::spawn(move || {
            for round in 0..10 {
                manager
                    .write(&entry, format!("round {round}").as_bytes())
                    .unwrap_or_else(|err| panic!("writer {writer} round {round}: {err}"));
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    manager.sync_all(SyncOptions::sync()).unwrap();
    drop(manager);
    let manager = self::manager();
    assert_eq!(manager.read(&seed).unwrap(), b"seed");
    for writer in 0..2 {
        let entry = path(&root, &format!("outer.zip/inner.tar/w{writer}"));
        assert_eq!(manager.read(&entry).unwrap(), b"round 9");
    }
}

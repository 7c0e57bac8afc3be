mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tempfile::tempdir;

use common::{FlakyEngine, Harness};
use vnode_rs::{CreateVnodeRequest, Error, ErrorCode, VnodeStatus};

#[test_log::test]
fn test_replays_logged_writes_after_crash() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    manager.create(&CreateVnodeRequest::new(1))?;

    // W1..W5 reach the log but never the engine
    harness.engine.set_failing(true);
    for i in 1..=5 {
        let result = manager.write(1, 1, format!("W{}", i).into_bytes());
        assert!(matches!(result, Err(Error::Tsdb(_))));
    }
    assert_eq!(manager.lookup(1).unwrap().version(), 5);
    assert!(harness.engine.rows(&harness.tsdb_path(1)).is_empty());

    manager.close(1)?;
    harness.engine.set_failing(false);
    manager.open(1)?;

    let rows = harness.engine.rows(&harness.tsdb_path(1));
    let versions: Vec<u64> = rows.iter().map(|row| row.version).collect();
    let bodies: Vec<&[u8]> = rows.iter().map(|row| row.body.as_slice()).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    assert_eq!(bodies, vec![&b"W1"[..], b"W2", b"W3", b"W4", b"W5"]);
    assert_eq!(manager.metrics().get_replayed_records(), 5);

    // New writes continue after the replayed ones
    assert_eq!(manager.write(1, 1, b"W6".to_vec())?, 6);

    Ok(())
}

#[test_log::test]
fn test_reopens_vnodes_on_restart() -> Result<()> {
    let dir = tempdir()?;

    {
        let harness = Harness::new(dir.path());
        harness.manager.create(&CreateVnodeRequest::new(1))?;
        harness.manager.create(&CreateVnodeRequest::new(2))?;
        for _ in 0..3 {
            harness.manager.write(1, 1, b"row".to_vec())?;
        }
    }

    // A fresh engine gets its rows back from the log. Data of a vnode
    // dropped before the restart is cleaned up.
    fs::write(dir.path().join("not-a-vnode"), b"")?;
    fs::create_dir_all(dir.path().join("vnode5.dropped.1700000000000000-0").join("wal"))?;
    let harness = Harness::with_engine(dir.path(), Arc::new(FlakyEngine::new(1024)));
    assert_eq!(harness.manager.open_existing()?, vec![1, 2]);

    assert_eq!(harness.manager.lookup(1).unwrap().version(), 3);
    assert_eq!(harness.engine.rows(&harness.tsdb_path(1)).len(), 3);
    assert_eq!(harness.manager.lookup(2).unwrap().version(), 0);
    assert_eq!(harness.dir_entries(), vec!["not-a-vnode", "vnode1", "vnode2"]);

    Ok(())
}

#[test_log::test]
fn test_concurrent_acquire_release_frees_once() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;
    manager.create(&CreateVnodeRequest::new(1))?;

    let held = manager.acquire(1)?;

    thread::scope(|s| {
        for _ in 0..100 {
            s.spawn(|| {
                if let Ok(handle) = manager.acquire(1) {
                    assert!(handle.write_queue().is_some());
                    manager.release(handle);
                }
            });
        }
        s.spawn(|| manager.close(1).unwrap());
    });

    assert!(!manager.contains(1));
    assert_eq!(held.ref_count(), 1);
    assert_eq!(manager.metrics().get_free_count(), 0);
    assert_eq!(harness.dispatcher.live_queues(), 2);

    // Clones of the last handle race to zero
    thread::scope(|s| {
        for _ in 0..100 {
            s.spawn(|| drop(held.clone()));
        }
    });
    assert_eq!(manager.metrics().get_free_count(), 0);

    manager.release(held);
    assert_eq!(manager.metrics().get_free_count(), 1);
    assert_eq!(harness.dispatcher.live_queues(), 0);
    assert_eq!(harness.dispatcher.freed_queues(), 2);
    assert_eq!(manager.metrics().get_open_vnodes(), 0);

    Ok(())
}

#[test_log::test]
fn test_dropped_vnode_stays_usable_through_old_handle() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;
    manager.create(&CreateVnodeRequest::new(9))?;
    let root = dir.path().join("vnode9");

    let handle = manager.acquire(9)?;
    manager.drop_vnode(9)?;

    assert!(matches!(manager.acquire(9), Err(Error::InvalidVgroupId(9))));
    assert_eq!(handle.status(), VnodeStatus::Deleting);
    assert!(handle.is_drop_pending());
    assert!(handle.write_queue().is_some());
    assert!(matches!(handle.write(1, vec![]), Err(Error::NotActiveVnode(9))));

    // The data is moved aside at once and removed with the last reference
    let moved = handle.data_dir();
    assert!(!root.exists());
    assert!(moved.join("config").exists());

    manager.release(handle);
    assert!(!moved.exists());
    assert!(harness.dir_entries().is_empty());
    assert_eq!(harness.dispatcher.live_queues(), 0);
    assert_eq!(manager.metrics().get_drop_count(), 1);

    Ok(())
}

#[test_log::test]
fn test_recreate_while_dropped_vnode_is_held() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    manager.create(&CreateVnodeRequest::new(1))?;
    for _ in 0..3 {
        manager.write(1, 1, b"old".to_vec())?;
    }

    let old = manager.acquire(1)?;
    manager.drop_vnode(1)?;

    manager.create(&CreateVnodeRequest::new(1))?;
    assert_eq!(manager.lookup(1).unwrap().status(), VnodeStatus::Ready);
    assert_eq!(manager.write(1, 1, b"new".to_vec())?, 1);

    // Letting go of the old vnode leaves the new one alone
    manager.release(old);
    assert_eq!(harness.dir_entries(), vec!["vnode1"]);
    assert!(dir.path().join("vnode1").join("config").exists());
    assert_eq!(harness.bodies(1), vec!["new"]);

    manager.close(1)?;
    manager.open(1)?;
    assert_eq!(manager.lookup(1).unwrap().version(), 1);
    assert_eq!(manager.write(1, 1, b"newer".to_vec())?, 2);
    assert_eq!(harness.bodies(1), vec!["new", "newer"]);

    Ok(())
}

#[test_log::test]
fn test_recreate_after_drop() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    manager.create(&CreateVnodeRequest::new(1))?;
    for _ in 0..3 {
        manager.write(1, 1, b"old".to_vec())?;
    }
    manager.drop_vnode(1)?;
    assert!(harness.dir_entries().is_empty());

    manager.create(&CreateVnodeRequest::new(1))?;
    assert_eq!(manager.write(1, 1, b"new".to_vec())?, 1);
    assert_eq!(harness.bodies(1), vec!["new"]);
    assert_eq!(manager.metrics().get_free_count(), 1);

    Ok(())
}

#[test_log::test]
fn test_reopen_without_commit_log_keeps_version() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    manager.create(&CreateVnodeRequest::new(2).with_commit_log(false))?;
    assert_eq!(manager.write(2, 1, b"a".to_vec())?, 1);
    assert_eq!(manager.write(2, 1, b"b".to_vec())?, 2);

    // Nothing to replay, the engine knows where it stopped
    manager.close(2)?;
    manager.open(2)?;
    assert_eq!(manager.lookup(2).unwrap().version(), 2);
    assert_eq!(manager.metrics().get_replayed_records(), 0);

    assert_eq!(manager.write(2, 1, b"c".to_vec())?, 3);
    assert_eq!(harness.bodies(2), vec!["a", "b", "c"]);

    Ok(())
}

#[test_log::test]
fn test_rollover_error_fails_the_write() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::with_engine(dir.path(), Arc::new(FlakyEngine::new(2)));
    let manager = &harness.manager;
    manager.create(&CreateVnodeRequest::new(1))?;

    harness.wal.set_failing_renew(true);
    assert_eq!(manager.write(1, 1, b"first".to_vec())?, 1);

    // The second row makes the engine commit and ask for a new segment
    let result = manager.write(1, 1, b"second".to_vec());
    assert!(matches!(result, Err(Error::Wal(_))));
    assert_eq!(ErrorCode::of(&result), ErrorCode::WalError);
    assert_eq!(manager.metrics().get_wal_renew_count(), 0);

    // The row was logged, so its version is taken
    assert_eq!(manager.lookup(1).unwrap().version(), 2);

    harness.wal.set_failing_renew(false);
    assert_eq!(manager.write(1, 1, b"third".to_vec())?, 3);
    assert_eq!(manager.write(1, 1, b"fourth".to_vec())?, 4);
    assert_eq!(manager.metrics().get_wal_renew_count(), 1);

    Ok(())
}

#[test_log::test]
fn test_create_refuses_unreadable_peer() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    let result = manager.create(&CreateVnodeRequest::new(3).with_peer(-3, 1));
    assert!(matches!(result, Err(Error::Config(_))));
    let result = manager.create(&CreateVnodeRequest::new(3).with_peer(1, u32::MAX));
    assert!(matches!(result, Err(Error::Config(_))));

    assert!(!manager.contains(3));
    assert!(harness.dir_entries().is_empty());
    assert_eq!(manager.metrics().get_create_count(), 0);

    Ok(())
}

#[test_log::test]
fn test_missing_ids() {
    let dir = tempdir().unwrap();
    let harness = Harness::new(dir.path());

    let closed = harness.manager.close(42);
    assert_eq!(ErrorCode::of(&closed), ErrorCode::Success);

    let dropped = harness.manager.drop_vnode(42);
    assert_eq!(ErrorCode::of(&dropped), ErrorCode::InvalidVgroupId);

    assert!(harness.manager.acquire(42).unwrap_err().is_not_found());
}

#[test_log::test]
fn test_status_report_skips_dropped() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    for id in 1..=3 {
        manager.create(&CreateVnodeRequest::new(id))?;
    }
    manager.drop_vnode(2)?;

    let report = manager.status_report();
    assert_eq!(report.ids(), vec![1, 3]);
    assert!(report.loads.iter().all(|load| load.status == VnodeStatus::Ready));
    assert_eq!(report.encode(), vec![0, 0, 0, 1, 1, 0, 0, 0, 3, 1]);

    assert_eq!(manager.build_status_report(1).ids(), vec![1]);

    Ok(())
}

#[test_log::test]
fn test_duplicate_create_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;
    let req = CreateVnodeRequest::new(7).with_peer(1, 16_777_343);

    manager.create(&req)?;
    let config = fs::read_to_string(dir.path().join("vnode7").join("config"))?;
    manager.create(&req)?;

    assert_eq!(fs::read_dir(dir.path())?.count(), 1);
    assert_eq!(fs::read_to_string(dir.path().join("vnode7").join("config"))?, config);
    assert_eq!(manager.registry().len(), 1);
    assert_eq!(manager.metrics().get_create_count(), 1);
    assert_eq!(manager.metrics().get_open_count(), 1);

    Ok(())
}

#[test_log::test]
fn test_create_reuses_leftover_directory() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    fs::create_dir(dir.path().join("vnode3"))?;

    harness.manager.create(&CreateVnodeRequest::new(3))?;
    assert_eq!(harness.manager.lookup(3).unwrap().status(), VnodeStatus::Ready);

    Ok(())
}

#[test_log::test]
fn test_damaged_config_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    manager.create(&CreateVnodeRequest::new(4).with_peer(1, 1).with_peer(2, 2))?;
    manager.close(4)?;

    let config = dir.path().join("vnode4").join("config");
    let content = fs::read_to_string(&config)?;
    let truncated: String = content.lines().take(6).map(|line| format!("{}\n", line)).collect();
    fs::write(&config, truncated)?;

    let result = manager.open(4);
    assert_eq!(ErrorCode::of(&result), ErrorCode::InvalidFileFormat);
    assert!(!manager.contains(4));
    assert_eq!(harness.dispatcher.live_queues(), 0);

    Ok(())
}

#[test_log::test]
fn test_engine_commits_renew_the_log() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::with_engine(dir.path(), Arc::new(FlakyEngine::new(2)));
    let manager = &harness.manager;
    manager.create(&CreateVnodeRequest::new(1))?;

    // Every second row the engine commits and rolls the log
    for _ in 0..8 {
        manager.write(1, 1, b"row".to_vec())?;
    }
    assert_eq!(manager.metrics().get_wal_renew_count(), 4);

    let segments = fs::read_dir(dir.path().join("vnode1").join("wal"))?.count();
    assert_eq!(segments, manager.config().wal_file_count as usize);

    Ok(())
}

#[test_log::test]
fn test_close_all() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::new(dir.path());
    let manager = &harness.manager;

    for id in 1..=4 {
        manager.create(&CreateVnodeRequest::new(id))?;
    }
    manager.close_all()?;

    assert!(manager.registry().is_empty());
    assert_eq!(manager.metrics().get_close_count(), 4);
    assert_eq!(manager.metrics().get_free_count(), 4);
    assert_eq!(harness.dispatcher.live_queues(), 0);

    // Data stays on disk after a close
    assert!(dir.path().join("vnode3").join("config").exists());

    Ok(())
}

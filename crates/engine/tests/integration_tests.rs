/// End-to-end tests through the public `Db` API only.
/// Covers: record operations, concurrent transactions, crash recovery,
/// background compaction, configuration loading.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use engine::{Config, Db, Error, Fields, Value};
use tempfile::tempdir;

fn test_config() -> Config {
    Config {
        memtable_size: 32 * 1024,
        sync_writes: false,
        l0_compact_threshold: 2,
        l0_capacity: 64 * 1024,
        level_multiplier: 64 * 1024,
        compaction_interval: Duration::from_millis(25),
        file_workers: 4,
        ..Config::default()
    }
}

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

// --------------------- Records ---------------------

#[test]
fn record_lifecycle() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), test_config())?;

    db.insert("test", fields(&[("value", Value::from("a"))]))?;
    db.update("test", fields(&[("value", Value::from("b"))]))?;
    assert_eq!(db.read("test", &["value"])?["value"], Value::from("b"));

    db.delete("test")?;
    assert!(matches!(db.read("test", &["value"]), Err(Error::KeyNotFound)));
    assert!(matches!(
        db.update("test", fields(&[("value", Value::from("c"))])),
        Err(Error::KeyNotFound)
    ));
    db.close()?;
    Ok(())
}

#[test]
fn scan_sees_latest_of_each_key() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), test_config())?;
    let mut expected = BTreeMap::new();

    for round in 0..5i64 {
        db.update_txn(|t| {
            for i in 0..400 {
                t.write(&format!("user{:04}", i), round * 1000 + i)?;
            }
            Ok(())
        })?;
        db.force_flush()?;
    }
    for i in 0..400 {
        expected.insert(format!("user{:04}", i), Value::Int(4000 + i));
    }
    for i in (0..400).step_by(3) {
        db.update_txn(|t| t.delete(&format!("user{:04}", i)))?;
        expected.remove(&format!("user{:04}", i));
    }

    let got: BTreeMap<String, Value> = db
        .view_txn(|t| t.scan("user0000", "user9999"))?
        .into_iter()
        .collect();
    assert_eq!(got, expected);
    Ok(())
}

// --------------------- Concurrency ---------------------

#[test]
fn concurrent_increments_never_lose_updates() -> Result<()> {
    let dir = tempdir()?;
    let db = Arc::new(Db::open(dir.path(), test_config())?);
    db.update_txn(|t| t.write("counter", 0i64))?;

    let aborts = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let aborts = Arc::clone(&aborts);
            thread::spawn(move || {
                let mut done = 0;
                while done < 25 {
                    let res = db.update_txn(|t| {
                        let n = t.read("counter")?.as_int()?;
                        t.write("counter", n + 1)
                    });
                    match res {
                        Ok(()) => done += 1,
                        Err(Error::TxnAbort) => {
                            aborts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker panicked");
    }

    // every successful commit read the value the previous one wrote
    assert_eq!(db.view_txn(|t| t.read("counter"))?, Value::Int(100));
    Ok(())
}

#[test]
fn conflicting_commit_aborts() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), test_config())?;
    db.insert("acct", fields(&[("balance", Value::Int(10))]))?;

    let mut t1 = db.begin(false)?;
    let mut t2 = db.begin(false)?;
    t1.read("acct")?;
    t2.read("acct")?;
    t1.write("acct", "t1")?;
    t2.write("acct", "t2")?;

    assert!(db.commit(t1)?.is_some());
    assert!(matches!(db.commit(t2), Err(Error::TxnAbort)));
    assert_eq!(db.view_txn(|t| t.read("acct"))?, Value::from("t1"));
    Ok(())
}

// --------------------- Recovery ---------------------

#[test]
fn crash_keeps_every_acknowledged_commit() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), test_config())?;
        for i in 0..3_000i64 {
            db.update_txn(|t| t.write(&format!("k{:05}", i), i))?;
        }
        db.update_txn(|t| t.write("blob", vec![3u8; 10_000]))?;
        // no close: threads and buffers are abandoned mid-flight
        std::mem::forget(db);
    }

    let db = Db::open(dir.path(), test_config())?;
    for i in 0..3_000i64 {
        assert_eq!(db.view_txn(|t| t.read(&format!("k{:05}", i)))?, Value::Int(i));
    }
    assert_eq!(db.view_txn(|t| t.read("blob"))?, Value::Bytes(vec![3u8; 10_000]));
    Ok(())
}

#[test]
fn commits_after_reopen_are_newer() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), test_config())?;
        db.update_txn(|t| t.write("k", "before"))?;
        db.force_flush()?;
        db.close()?;
    }
    let db = Db::open(dir.path(), test_config())?;
    db.update_txn(|t| t.write("k", "after"))?;
    db.force_flush()?;
    assert_eq!(db.view_txn(|t| t.read("k"))?, Value::from("after"));
    Ok(())
}

// --------------------- Compaction ---------------------

#[test]
fn background_compaction_keeps_every_key() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), test_config())?;
    for batch in 0..40usize {
        db.update_txn(|t| {
            for i in batch * 250..(batch + 1) * 250 {
                t.write(&format!("key{:06}", i), format!("value-{}", i))?;
            }
            Ok(())
        })?;
    }
    db.force_flush()?;

    let pushed_down = eventually(Duration::from_secs(30), || {
        db.stats()
            .map(|s| s.levels[1..].iter().any(|l| l.files > 0))
            .unwrap_or(false)
    });
    assert!(pushed_down, "nothing left L0: {:?}", db.stats()?);

    db.view_txn(|t| {
        for i in 0..10_000 {
            let key = format!("key{:06}", i);
            assert_eq!(t.read(&key)?, Value::from(format!("value-{}", i)), "{}", key);
        }
        Ok(())
    })?;
    assert_eq!(db.view_txn(|t| t.scan("key000000", "key999999"))?.len(), 10_000);
    Ok(())
}

// --------------------- Configuration ---------------------

#[test]
fn open_with_toml_config() -> Result<()> {
    let dir = tempdir()?;
    let config: Config = r#"
        memtable_size = 8192
        sync_writes = false
        compaction_interval = "100ms"
    "#
    .parse()?;
    let db = Db::open(dir.path(), config)?;
    assert_eq!(db.config().memtable_size, 8192);
    db.insert("k", Fields::new())?;
    Ok(())
}

#[test]
fn open_rejects_invalid_config() -> Result<()> {
    let dir = tempdir()?;
    let config = Config {
        memtable_size: 0,
        ..Config::default()
    };
    assert!(Db::open(dir.path(), config).is_err());
    Ok(())
}

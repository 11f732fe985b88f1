use super::helpers::{count_sst_files, quiet_config, small_config, wait_until};
use crate::manifest;
use crate::*;
use anyhow::Result;
use config::Config;
use sstable::SstReader;
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(20);

fn put_range(db: &Db, from: usize, to: usize, tag: &str) -> codec::Result<()> {
    db.update_txn(|t| {
        for i in from..to {
            t.write(&format!("key{:05}", i), format!("{}-{}", tag, i))?;
        }
        Ok(())
    })
}

fn level_files(db: &Db, n: usize) -> usize {
    db.stats().map(|s| s.levels[n].files).unwrap_or(0)
}

/// L0 is empty in memory and on disk; a merge unlinks its inputs last.
fn l0_drained(db: &Db, root: &std::path::Path) -> bool {
    level_files(db, 0) == 0 && count_sst_files(&root.join("L0")) == 0
}

fn assert_values(db: &Db, from: usize, to: usize, tag: &str) -> Result<()> {
    db.view_txn(|t| {
        for i in from..to {
            let key = format!("key{:05}", i);
            assert_eq!(t.read(&key)?, Value::from(format!("{}-{}", tag, i)), "{}", key);
        }
        Ok(())
    })?;
    Ok(())
}

// --------------------- Flush ---------------------

#[test_log::test]
fn flush_goes_to_l0() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    put_range(&db, 0, 100, "v")?;
    db.force_flush()?;

    assert_eq!(level_files(&db, 0), 1);
    assert_eq!(count_sst_files(&dir.path().join("L0")), 1);
    // the flushed WAL is gone; only the fresh one remains
    let wals: Vec<_> = fs::read_dir(dir.path().join("memtables"))?.collect();
    assert_eq!(wals.len(), 1);
    assert!(dir.path().join("memtables").join("WAL_2").exists());

    assert_values(&db, 0, 100, "v")?;
    Ok(())
}

#[test]
fn flush_of_empty_memtable_is_noop() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    db.force_flush()?;
    assert_eq!(level_files(&db, 0), 0);
    Ok(())
}

#[test]
fn memtable_rotates_when_full() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    for i in 0..20 {
        put_range(&db, i * 50, (i + 1) * 50, "v")?;
    }
    // 1000 entries are well over the 16 KiB memtable
    assert!(wait_until(WAIT, || level_files(&db, 0) > 0));
    assert!(wait_until(WAIT, || db.stats().map(|s| s.memtables == 1).unwrap_or(false)));
    assert_values(&db, 0, 1000, "v")?;
    Ok(())
}

#[test]
fn newest_version_wins_across_flushes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    put_range(&db, 0, 50, "old")?;
    db.force_flush()?;
    put_range(&db, 25, 75, "new")?;
    db.force_flush()?;
    db.update_txn(|t| t.delete("key00010"))?;

    assert_values(&db, 0, 10, "old")?;
    assert_values(&db, 11, 25, "old")?;
    assert_values(&db, 25, 75, "new")?;
    assert!(matches!(db.view_txn(|t| t.read("key00010")), Err(Error::KeyNotFound)));

    let scanned = db.view_txn(|t| t.scan("key00000", "key00099"))?;
    assert_eq!(scanned.len(), 74);
    assert_eq!(scanned[30].1, Value::from("new-31"));
    Ok(())
}

// --------------------- Compaction ---------------------

#[test_log::test]
fn force_compact_merges_l0_into_l1() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    for round in 0..3 {
        put_range(&db, 0, 200, &format!("r{}", round))?;
        db.force_flush()?;
    }
    assert_eq!(level_files(&db, 0), 3);

    db.force_compact(0)?;
    assert!(wait_until(WAIT, || l0_drained(&db, dir.path())));
    assert_eq!(level_files(&db, 1), 1);
    assert_eq!(count_sst_files(&dir.path().join("L1")), 1);

    // every version survives; reads still pick the newest
    assert_values(&db, 0, 200, "r2")?;
    Ok(())
}

#[test]
fn single_file_is_transplanted() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    put_range(&db, 0, 100, "v")?;
    db.force_flush()?;
    let l0_ids = db_file_ids(&dir.path().join("L0"))?;
    assert_eq!(l0_ids.len(), 1);

    db.force_compact(0)?;
    assert!(wait_until(WAIT, || l0_drained(&db, dir.path())));
    assert_eq!(level_files(&db, 1), 1);
    assert_eq!(db_file_ids(&dir.path().join("L1"))?, l0_ids);
    assert_values(&db, 0, 100, "v")?;
    Ok(())
}

#[test]
fn disjoint_files_move_separately() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    put_range(&db, 0, 50, "a")?;
    db.force_flush()?;
    put_range(&db, 100, 150, "b")?;
    db.force_flush()?;
    put_range(&db, 120, 130, "c")?;
    db.force_flush()?;

    db.force_compact(0)?;
    assert!(wait_until(WAIT, || l0_drained(&db, dir.path())));
    // [0,50) moves as is; the two overlapping files merge into one
    assert_eq!(level_files(&db, 1), 2);
    assert_values(&db, 0, 50, "a")?;
    assert_values(&db, 100, 120, "b")?;
    assert_values(&db, 120, 130, "c")?;
    assert_values(&db, 130, 150, "b")?;
    Ok(())
}

#[test_log::test]
fn l0_threshold_triggers_compaction() -> Result<()> {
    let dir = tempdir()?;
    let config = Config {
        l0_compact_threshold: 3,
        ..quiet_config()
    };
    let db = Db::open(dir.path(), config)?;
    for round in 0..3 {
        put_range(&db, round * 100, round * 100 + 100, "v")?;
        db.force_flush()?;
    }
    assert!(wait_until(WAIT, || level_files(&db, 0) == 0));
    assert_eq!(level_files(&db, 1), 3);
    assert_values(&db, 0, 300, "v")?;
    Ok(())
}

#[test_log::test]
fn capacity_pushes_data_down() -> Result<()> {
    let dir = tempdir()?;
    // every level up to L3 is smaller than a single file
    let config = Config {
        l0_capacity: 1,
        level_multiplier: 1,
        ..small_config()
    };
    let db = Db::open(dir.path(), config)?;
    for i in 0..10 {
        put_range(&db, i * 100, (i + 1) * 100, "v")?;
        db.force_flush()?;
    }

    let settled = wait_until(WAIT, || {
        db.stats()
            .map(|s| s.levels[..4].iter().all(|l| l.files == 0))
            .unwrap_or(false)
    });
    assert!(settled, "levels did not drain: {:?}", db.stats()?);
    assert!(db.stats()?.levels[4..].iter().any(|l| l.files > 0));
    assert_values(&db, 0, 1000, "v")?;
    Ok(())
}

#[test]
fn reads_stay_correct_during_compaction() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), small_config())?;
    put_range(&db, 0, 500, "v")?;
    db.force_flush()?;

    std::thread::scope(|s| -> Result<()> {
        let writer = s.spawn(|| -> Result<()> {
            for i in 0..10 {
                put_range(&db, 500 + i * 50, 550 + i * 50, "v")?;
                db.force_flush()?;
                db.force_compact(0)?;
            }
            Ok(())
        });
        for _ in 0..20 {
            assert_values(&db, 0, 500, "v")?;
        }
        writer.join().expect("writer panicked")?;
        Ok(())
    })?;
    assert_values(&db, 0, 1000, "v")?;
    Ok(())
}

#[test]
fn scan_sees_rows_while_they_are_flushed() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    let batch = 200;

    for round in 0..20 {
        put_range(&db, round * batch, (round + 1) * batch, "v")?;
        let committed = (round + 1) * batch;

        std::thread::scope(|s| -> Result<()> {
            let flusher = s.spawn(|| db.force_flush());
            loop {
                let rows = db.view_txn(|t| t.scan("key00000", "key99999"))?;
                assert_eq!(rows.len(), committed, "round {}", round);
                if flusher.is_finished() {
                    break;
                }
            }
            flusher.join().expect("flusher panicked")?;
            Ok(())
        })?;
    }
    assert_values(&db, 0, 20 * batch, "v")?;
    Ok(())
}

// --------------------- Open-time cleanup ---------------------

#[test]
fn open_removes_orphans_and_scratch_files() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), quiet_config())?;
        put_range(&db, 0, 10, "v")?;
        db.force_flush()?;
    }
    let l1 = dir.path().join("L1");
    fs::write(l1.join("999.sst"), b"junk")?;
    fs::write(l1.join("1000.sst.tmp"), b"junk")?;
    fs::write(l1.join(manifest::MANIFEST_NEW_FILENAME), b"junk")?;

    let db = Db::open(dir.path(), quiet_config())?;
    assert!(!l1.join("999.sst").exists());
    assert!(!l1.join("1000.sst.tmp").exists());
    assert!(!l1.join(manifest::MANIFEST_NEW_FILENAME).exists());
    assert_eq!(level_files(&db, 0), 1);
    assert_values(&db, 0, 10, "v")?;
    Ok(())
}

#[test]
fn open_finishes_interrupted_transplant() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), quiet_config())?;
        put_range(&db, 0, 10, "v")?;
        db.force_flush()?;
    }
    // crash after the file was registered below but before it left L0
    let l0 = dir.path().join("L0");
    let l1 = dir.path().join("L1");
    let id = db_file_ids(&l0)?[0];
    let name = sstable::sst_file_name(id);
    fs::hard_link(l0.join(&name), l1.join(&name))?;
    let range = SstReader::open(l1.join(&name))?.meta()?.range;
    manifest::save(&l1, [(id, &range)])?;

    let db = Db::open(dir.path(), quiet_config())?;
    assert_eq!(level_files(&db, 0), 0);
    assert_eq!(level_files(&db, 1), 1);
    assert!(!l0.join(&name).exists());
    assert_values(&db, 0, 10, "v")?;
    Ok(())
}

#[test]
fn open_drops_manifest_entries_without_files() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Db::open(dir.path(), quiet_config())?;
        put_range(&db, 0, 10, "v")?;
        db.force_flush()?;
        put_range(&db, 10, 20, "v")?;
        db.force_flush()?;
    }
    let l0 = dir.path().join("L0");
    let ids = db_file_ids(&l0)?;
    fs::remove_file(l0.join(sstable::sst_file_name(ids[1])))?;

    let db = Db::open(dir.path(), quiet_config())?;
    assert_eq!(level_files(&db, 0), 1);
    assert_values(&db, 0, 10, "v")?;
    assert!(matches!(db.view_txn(|t| t.read("key00015")), Err(Error::KeyNotFound)));
    Ok(())
}

fn db_file_ids(level_dir: &std::path::Path) -> Result<Vec<u64>> {
    let mut ids: Vec<u64> = manifest::load(level_dir)?.into_iter().map(|(id, _)| id).collect();
    ids.sort_unstable();
    Ok(ids)
}

use super::sample_entries;
use crate::*;
use anyhow::Result;
use codec::{Entry, Error, Value, ValuePointer};
use std::fs;
use std::path::PathBuf;
use tempfile::{tempdir, TempDir};

fn write_sample(n: usize, versions: u64, block_size: usize) -> Result<(TempDir, PathBuf, Vec<Entry>)> {
    let dir = tempdir()?;
    let path = dir.path().join(sst_file_name(1));
    let entries = sample_entries(n, versions);
    SstWriter::write(&path, block_size, &entries)?;
    Ok((dir, path, entries))
}

// -------------------- Open --------------------

#[test]
fn open_reports_block_geometry() -> Result<()> {
    let (_dir, path, _) = write_sample(200, 1, 512)?;
    let r = SstReader::open(&path)?;
    assert_eq!(r.block_size(), 512);
    assert!(r.num_blocks() > 1);
    assert_eq!(r.header().max_ts, 1);
    Ok(())
}

#[test]
fn meta_roundtrips_range_and_bloom() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("7.sst");
    let written = SstWriter::write(&path, 4096, &sample_entries(300, 2))?;

    let meta = SstReader::open(&path)?.meta()?;
    assert_eq!(meta.range, written.range);
    assert_eq!(meta.bloom, written.bloom);
    assert_eq!(meta.size, written.size);
    assert_eq!(meta.max_ts, 2);
    assert!(meta.bloom.may_contain(b"key00123"));
    Ok(())
}

#[test]
fn truncated_file_is_rejected() -> Result<()> {
    let (_dir, path, _) = write_sample(50, 1, 256)?;
    let raw = fs::read(&path)?;
    fs::write(&path, &raw[..raw.len() - 3])?;
    assert!(matches!(SstReader::open(&path), Err(Error::Corrupt(_))));

    fs::write(&path, &raw[..10])?;
    assert!(matches!(
        SstReader::open(&path),
        Err(Error::ReadUnexpectedBytes { .. })
    ));
    Ok(())
}

// -------------------- Find --------------------

#[test]
fn find_every_key() -> Result<()> {
    let (_dir, path, _) = write_sample(500, 1, 256)?;
    let mut r = SstReader::open(&path)?;
    for i in 0..500 {
        let key = format!("key{:05}", i);
        let e = r.find(&key, u64::MAX)?.expect("key must exist");
        assert_eq!(e.key, key);
        assert_eq!(e.into_value(), Some(Value::Int(i * 100 + 1)));
    }
    Ok(())
}

#[test]
fn find_missing_keys() -> Result<()> {
    let (_dir, path, _) = write_sample(100, 1, 256)?;
    let mut r = SstReader::open(&path)?;
    assert!(r.find("a", u64::MAX)?.is_none());
    assert!(r.find("key00050x", u64::MAX)?.is_none());
    assert!(r.find("zzz", u64::MAX)?.is_none());
    Ok(())
}

#[test]
fn find_respects_snapshot() -> Result<()> {
    let (_dir, path, _) = write_sample(20, 3, 4096)?;
    let mut r = SstReader::open(&path)?;
    assert_eq!(r.find("key00007", 10)?.map(|e| e.ts), Some(3));
    assert_eq!(r.find("key00007", 3)?.map(|e| e.ts), Some(2));
    assert_eq!(r.find("key00007", 2)?.map(|e| e.ts), Some(1));
    assert!(r.find("key00007", 1)?.is_none());
    Ok(())
}

#[test]
fn find_follows_versions_across_blocks() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.sst");
    // 40 versions of one key cannot fit a 128-byte block
    let mut entries: Vec<Entry> = (1..=40u64)
        .rev()
        .map(|ts| Entry::new("hot", ts, Value::Int(ts as i64)))
        .collect();
    entries.push(Entry::new("zebra", 1, Value::Int(0)));
    SstWriter::write(&path, 128, &entries)?;

    let mut r = SstReader::open(&path)?;
    assert!(r.num_blocks() > 5);
    assert_eq!(r.find("hot", 2)?.map(|e| e.ts), Some(1));
    assert_eq!(r.find("hot", 25)?.map(|e| e.ts), Some(24));
    assert_eq!(r.find("zebra", 2)?.map(|e| e.ts), Some(1));
    Ok(())
}

#[test]
fn find_returns_tombstones_and_pointers() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("1.sst");
    let ptr = ValuePointer {
        offset: 99,
        size: 1000,
    };
    let entries = vec![
        Entry::tombstone("a", 5),
        Entry::new("a", 4, Value::from("old")),
        Entry::separated("b", 3, ptr),
    ];
    SstWriter::write(&path, 4096, &entries)?;

    let mut r = SstReader::open(&path)?;
    assert!(r.find("a", 6)?.map(|e| e.is_tombstone()).unwrap_or(false));
    assert_eq!(r.find("a", 5)?.and_then(|e| e.into_value()), Some(Value::from("old")));
    assert_eq!(r.find("b", 6)?.and_then(|e| e.pointer()), Some(ptr));
    Ok(())
}

// -------------------- Range / read_all --------------------

#[test]
fn range_spans_blocks_and_dedups_versions() -> Result<()> {
    let (_dir, path, _) = write_sample(200, 3, 256)?;
    let mut r = SstReader::open(&path)?;

    let got = r.range("key00010", "key00059", u64::MAX)?;
    assert_eq!(got.len(), 50);
    assert_eq!(got[0].key, "key00010");
    assert_eq!(got[49].key, "key00059");
    assert!(got.iter().all(|e| e.ts == 3));

    let older = r.range("key00010", "key00019", 3)?;
    assert!(older.iter().all(|e| e.ts == 2));
    assert!(r.range("key00010", "key00019", 1)?.is_empty());
    Ok(())
}

#[test]
fn range_outside_file() -> Result<()> {
    let (_dir, path, _) = write_sample(10, 1, 4096)?;
    let mut r = SstReader::open(&path)?;
    assert!(r.range("a", "b", u64::MAX)?.is_empty());
    assert!(r.range("z", "zz", u64::MAX)?.is_empty());
    assert!(r.range("key00005", "key00001", u64::MAX)?.is_empty());
    Ok(())
}

#[test]
fn read_all_returns_stored_order() -> Result<()> {
    let (_dir, path, entries) = write_sample(120, 2, 256)?;
    let mut r = SstReader::open(&path)?;
    assert_eq!(r.read_all()?, entries);
    Ok(())
}

#[test]
fn file_names() {
    assert_eq!(sst_file_name(42), "42.sst");
    assert_eq!(parse_sst_id("42.sst"), Some(42));
    assert_eq!(parse_sst_id("42.sst.tmp"), None);
    assert_eq!(parse_sst_id("manifest"), None);
}

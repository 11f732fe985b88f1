use super::helpers::quiet_config;
use crate::*;
use anyhow::Result;
use tempfile::tempdir;

// --------------------- Reads and writes ---------------------

#[test]
fn own_writes_are_visible() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    db.update_txn(|t| {
        t.write("a", 1i64)?;
        assert_eq!(t.read("a")?, Value::Int(1));
        t.delete("a")?;
        assert!(matches!(t.read("a"), Err(Error::KeyNotFound)));
        t.write("a", "back")?;
        assert_eq!(t.read("a")?, Value::from("back"));
        Ok(())
    })?;
    assert_eq!(db.view_txn(|t| t.read("a"))?, Value::from("back"));
    Ok(())
}

#[test]
fn snapshot_ignores_later_commits() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    db.update_txn(|t| t.write("k", 1i64))?;

    let mut reader = db.begin(true)?;
    db.update_txn(|t| t.write("k", 2i64))?;
    db.update_txn(|t| t.delete("k"))?;

    assert_eq!(reader.read("k")?, Value::Int(1));
    assert!(matches!(db.view_txn(|t| t.read("k")), Err(Error::KeyNotFound)));
    Ok(())
}

#[test]
fn view_txn_rejects_writes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    let err = db.view_txn(|t| t.write("k", true)).unwrap_err();
    assert!(matches!(err, Error::ReadOnlyTxn));
    assert!(matches!(db.view_txn(|t| t.delete("k")), Err(Error::ReadOnlyTxn)));
    Ok(())
}

#[test]
fn key_and_value_limits() -> Result<()> {
    let dir = tempdir()?;
    let mut config = quiet_config();
    config.max_value_size = 1024;
    let db = Db::open(dir.path(), config)?;

    let long_key = "k".repeat(65);
    assert!(matches!(
        db.update_txn(|t| t.write(&long_key, 1i64)),
        Err(Error::ExceedMaxKeySize { .. })
    ));
    assert!(matches!(
        db.update_txn(|t| t.write("", 1i64)),
        Err(Error::InvalidKey(_))
    ));
    assert!(matches!(
        db.update_txn(|t| t.write("big", vec![0u8; 1025])),
        Err(Error::ExceedMaxValueSize { size: 1025, max: 1024 })
    ));
    db.update_txn(|t| t.write(&"k".repeat(64), vec![0u8; 1024]))?;
    Ok(())
}

#[test]
fn failed_closure_writes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    let res: codec::Result<()> = db.update_txn(|t| {
        t.write("a", 1i64)?;
        Err(Error::KeyAlreadyExists)
    });
    assert!(res.is_err());
    assert!(matches!(db.view_txn(|t| t.read("a")), Err(Error::KeyNotFound)));
    Ok(())
}

#[test]
fn every_value_kind_roundtrips() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    let values = vec![
        ("bool", Value::Bool(true)),
        ("int", Value::Int(-42)),
        ("float", Value::Float(2.5)),
        ("string", Value::from("hello")),
        ("bytes", Value::Bytes(vec![0, 1, 2, 255])),
        ("large", Value::Bytes(vec![7; 4096])),
    ];
    db.update_txn(|t| {
        for (k, v) in &values {
            t.write(k, v.clone())?;
        }
        Ok(())
    })?;
    for (k, v) in &values {
        assert_eq!(&db.view_txn(|t| t.read(k))?, v);
    }
    Ok(())
}

// --------------------- Scan ---------------------

#[test]
fn scan_overlays_pending_writes() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    db.update_txn(|t| {
        for i in 0..10i64 {
            t.write(&format!("k{}", i), i)?;
        }
        Ok(())
    })?;

    db.update_txn(|t| {
        t.delete("k3")?;
        t.write("k5", 500i64)?;
        t.write("k55", 55i64)?;
        let got = t.scan("k2", "k6")?;
        let keys: Vec<&str> = got.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["k2", "k4", "k5", "k55", "k6"]);
        assert_eq!(got[2].1, Value::Int(500));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn scan_hides_deleted_and_reversed_ranges() -> Result<()> {
    let dir = tempdir()?;
    let db = Db::open(dir.path(), quiet_config())?;
    db.update_txn(|t| {
        t.write("a", 1i64)?;
        t.write("b", 2i64)?;
        t.write("c", 3i64)
    })?;
    db.update_txn(|t| t.delete("b"))?;

    let got = db.view_txn(|t| t.scan("a", "z"))?;
    assert_eq!(
        got,
        vec![("a".to_string(), Value::Int(1)), ("c".to_string(), Value::Int(3))]
    );
    assert!(db.view_txn(|t| t.scan("z", "a"))?.is_empty());
    Ok(())
}

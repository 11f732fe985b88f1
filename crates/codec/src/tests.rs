use super::*;
use anyhow::Result;

// -------------------- Entry round-trip --------------------

fn roundtrip(entry: &Entry) -> Result<Entry> {
    let buf = entry.encode();
    assert_eq!(buf.len(), entry.encoded_len());
    Ok(Entry::decode_from(&buf)?)
}

#[test]
fn entry_roundtrip_every_value_type() -> Result<()> {
    let values = vec![
        Value::Bool(true),
        Value::Bool(false),
        Value::Int(i64::MIN),
        Value::Int(0),
        Value::Float(-1.5e300),
        Value::Float(f64::INFINITY),
        Value::String(String::new()),
        Value::String("héllo".to_string()),
        Value::Bytes(vec![0, 255, 1, 254]),
        Value::Bytes(Vec::new()),
        Value::Tombstone,
    ];
    for (ts, value) in values.into_iter().enumerate() {
        let entry = Entry::new("user:1", ts as u64, value);
        assert_eq!(roundtrip(&entry)?, entry);
    }
    Ok(())
}

#[test]
fn entry_roundtrip_separated_pointer() -> Result<()> {
    let entry = Entry::separated(
        "blob",
        u64::MAX,
        ValuePointer {
            offset: 1 << 40,
            size: 4096,
        },
    );
    let back = roundtrip(&entry)?;
    assert_eq!(back, entry);
    assert!(back.value().is_none());
    assert_eq!(back.pointer().map(|p| p.size), Some(4096));
    Ok(())
}

#[test]
fn truncated_entry_is_read_unexpected_bytes() {
    let buf = Entry::new("k", 7, Value::String("value".into())).encode();
    let err = Entry::decode_from(&buf[..buf.len() - 2]).unwrap_err();
    assert!(matches!(err, Error::ReadUnexpectedBytes { .. }), "{err}");
}

#[test]
fn unknown_tag_is_rejected() {
    let mut buf = Entry::new("k", 1, Value::Int(3)).encode();
    // tag sits right after ts (8) + key_len (2) + key (1)
    buf[11] = 0x42;
    let err = Entry::decode_from(&buf).unwrap_err();
    assert!(matches!(err, Error::UnknownValueType(0x42)));
}

#[test]
fn trailing_bytes_are_corruption() {
    let mut buf = Entry::new("k", 1, Value::Bool(true)).encode();
    buf.push(0);
    assert!(matches!(Entry::decode_from(&buf), Err(Error::Corrupt(_))));
}

#[test]
fn newest_first_ordering() {
    let mut entries = vec![
        Entry::new("b", 1, Value::Int(1)),
        Entry::new("a", 1, Value::Int(1)),
        Entry::new("a", 3, Value::Int(3)),
        Entry::new("b", 2, Value::Int(2)),
    ];
    entries.sort_by(Entry::cmp_newest_first);
    let order: Vec<_> = entries.iter().map(|e| (e.key.as_str(), e.ts)).collect();
    assert_eq!(order, vec![("a", 3), ("a", 1), ("b", 2), ("b", 1)]);
}

// -------------------- Values --------------------

#[test]
fn fixed_width_value_with_wrong_size() {
    let err = Value::from_raw(ValueKind::Int, &[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        Error::IncorrectValueSize {
            kind: ValueKind::Int,
            expected: 8,
            actual: 3
        }
    ));
}

#[test]
fn tagged_value_roundtrip() -> Result<()> {
    let v = Value::String("separated payload".into());
    assert_eq!(Value::from_tagged(&v.to_tagged())?, v);
    Ok(())
}

#[test]
fn typed_accessors_report_incompatible_value() {
    let v = Value::Int(5);
    assert_eq!(v.as_int().unwrap(), 5);
    assert!(matches!(
        v.as_str(),
        Err(Error::IncompatibleValue {
            expected: ValueKind::String,
            found: ValueKind::Int
        })
    ));
}

// -------------------- Rows --------------------

#[test]
fn row_roundtrip() -> Result<()> {
    let mut fields = Fields::new();
    fields.insert("name".into(), Value::from("alice"));
    fields.insert("age".into(), Value::Int(30));
    fields.insert("active".into(), Value::Bool(true));

    let value = Value::row(&fields)?;
    assert_eq!(value.as_row()?, fields);
    Ok(())
}

#[test]
fn row_rejects_oversized_field_name() -> Result<()> {
    let mut fields = Fields::new();
    fields.insert("f".repeat(MAX_FIELD_NAME_SIZE + 1), Value::Int(1));
    assert!(matches!(
        Value::row(&fields),
        Err(Error::ExceedMaxFieldNameSize { size, max }) if size == MAX_FIELD_NAME_SIZE + 1 && max == MAX_FIELD_NAME_SIZE
    ));

    let mut fields = Fields::new();
    fields.insert("f".repeat(MAX_FIELD_NAME_SIZE), Value::Int(1));
    assert_eq!(Value::row(&fields)?.as_row()?, fields);
    Ok(())
}

#[test]
fn row_from_non_bytes_value() {
    assert!(matches!(
        Value::Int(1).as_row(),
        Err(Error::IncompatibleValue { .. })
    ));
}

// -------------------- KeyRange --------------------

#[test]
fn key_range_contains_and_overlaps() {
    let r = KeyRange::new("c", "f");
    assert!(r.contains("c"));
    assert!(r.contains("d"));
    assert!(r.contains("f"));
    assert!(!r.contains("fa"));
    assert!(r.overlaps("a", "c"));
    assert!(r.overlaps("e", "z"));
    assert!(!r.overlaps("g", "z"));
}

#[test]
fn key_range_roundtrip() -> Result<()> {
    let r = KeyRange::new("alpha", "omega");
    assert_eq!(KeyRange::decode(&r.encode())?, r);
    Ok(())
}

#[test]
fn fixed_key_padding() -> Result<()> {
    let mut buf = Vec::new();
    write_fixed_key(&mut buf, "abc")?;
    assert_eq!(buf.len(), KEY_SIZE);
    assert_eq!(read_fixed_key(&buf)?, "abc");

    let too_long = "x".repeat(KEY_SIZE + 1);
    assert!(write_fixed_key(&mut buf, &too_long).is_err());
    Ok(())
}

#[test]
fn validate_key_rules() {
    assert!(validate_key("ok").is_ok());
    assert!(validate_key(&"k".repeat(KEY_SIZE)).is_ok());
    assert!(matches!(validate_key(""), Err(Error::InvalidKey(_))));
    assert!(matches!(validate_key("a\0b"), Err(Error::InvalidKey(_))));
    assert!(matches!(
        validate_key(&"k".repeat(KEY_SIZE + 1)),
        Err(Error::ExceedMaxKeySize { .. })
    ));
}

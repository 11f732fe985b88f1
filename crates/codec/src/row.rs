//! Record ("row") encoding: a set of named fields stored as one `Bytes` value.

use std::collections::BTreeMap;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::value::{Value, ValueKind};

/// The fields of one record, ordered by name.
pub type Fields = BTreeMap<String, Value>;

/// Longest field name a record can carry, in bytes.
pub const MAX_FIELD_NAME_SIZE: usize = u16::MAX as usize;

/// `[count: u32]` then per field `[name_len: u16][name][tag: u8][raw_len: u32][raw]`.
///
/// # Errors
///
/// [`Error::ExceedMaxFieldNameSize`] if a name does not fit its length prefix.
pub fn encode_fields(fields: &Fields) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let _ = buf.write_u32::<LittleEndian>(fields.len() as u32);
    for (name, value) in fields {
        let name_len = u16::try_from(name.len()).map_err(|_| Error::ExceedMaxFieldNameSize {
            size: name.len(),
            max: MAX_FIELD_NAME_SIZE,
        })?;
        let _ = buf.write_u16::<LittleEndian>(name_len);
        buf.extend_from_slice(name.as_bytes());
        buf.push(value.kind().tag());
        let _ = buf.write_u32::<LittleEndian>(value.raw_len() as u32);
        value.write_raw(&mut buf);
    }
    Ok(buf)
}

pub fn decode_fields(buf: &[u8]) -> Result<Fields> {
    let mut d = Decoder::new(buf);
    let count = d.u32()?;
    let mut fields = Fields::new();
    for _ in 0..count {
        let name = d.short_str()?;
        let kind = ValueKind::from_tag(d.u8()?)?;
        let len = d.u32()? as usize;
        fields.insert(name, Value::from_raw(kind, d.take(len)?)?);
    }
    if !d.is_empty() {
        return Err(Error::corrupt("trailing bytes after record fields"));
    }
    Ok(fields)
}

impl Value {
    /// Packs a record into a single `Bytes` value.
    pub fn row(fields: &Fields) -> Result<Value> {
        encode_fields(fields).map(Value::Bytes)
    }

    /// Unpacks a value written by [`Value::row`].
    pub fn as_row(&self) -> Result<Fields> {
        decode_fields(self.as_bytes()?)
    }
}

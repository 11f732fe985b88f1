use std::cmp::Ordering;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::value::{Value, ValueKind};

/// Tag written in place of a [`ValueKind`] when the value lives in the value log.
const SEPARATED_TAG: u8 = 0x80;

/// Location of a value stored in the value log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuePointer {
    pub offset: u64,
    pub size: u32,
}

/// Where an entry's value is: inline in the index, or behind a pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Inline(Value),
    Separated(ValuePointer),
}

/// One immutable version of a key.
///
/// Several entries for the same key coexist; readers pick the one with the
/// greatest `ts` strictly below their snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub ts: u64,
    pub key: String,
    pub payload: Payload,
}

impl Entry {
    pub fn new(key: impl Into<String>, ts: u64, value: Value) -> Self {
        Self {
            ts,
            key: key.into(),
            payload: Payload::Inline(value),
        }
    }

    pub fn tombstone(key: impl Into<String>, ts: u64) -> Self {
        Self::new(key, ts, Value::Tombstone)
    }

    pub fn separated(key: impl Into<String>, ts: u64, ptr: ValuePointer) -> Self {
        Self {
            ts,
            key: key.into(),
            payload: Payload::Separated(ptr),
        }
    }

    /// The inline value, or `None` when it still sits in the value log.
    pub fn value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Inline(v) => Some(v),
            Payload::Separated(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self.payload {
            Payload::Inline(v) => Some(v),
            Payload::Separated(_) => None,
        }
    }

    pub fn pointer(&self) -> Option<ValuePointer> {
        match self.payload {
            Payload::Separated(ptr) => Some(ptr),
            Payload::Inline(_) => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.payload, Payload::Inline(Value::Tombstone))
    }

    /// Sort order used everywhere entries are merged: key ascending, then
    /// newest version first.
    pub fn cmp_newest_first(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.ts.cmp(&self.ts))
    }

    /// Exact number of bytes [`encode_into`](Entry::encode_into) appends.
    pub fn encoded_len(&self) -> usize {
        let head = 8 + 2 + self.key.len() + 1;
        match &self.payload {
            Payload::Inline(v) => head + 4 + v.raw_len(),
            Payload::Separated(_) => head + 8 + 4,
        }
    }

    /// Layout:
    ///
    /// ```text
    /// [ts: u64][key_len: u16][key][tag: u8]
    ///   inline:    [raw_len: u32][raw]
    ///   separated: [offset: u64][size: u32]     (tag = 0x80)
    /// ```
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        // Writes into a Vec cannot fail.
        let _ = buf.write_u64::<LittleEndian>(self.ts);
        let _ = buf.write_u16::<LittleEndian>(self.key.len() as u16);
        buf.extend_from_slice(self.key.as_bytes());
        match &self.payload {
            Payload::Inline(v) => {
                buf.push(v.kind().tag());
                let _ = buf.write_u32::<LittleEndian>(v.raw_len() as u32);
                v.write_raw(buf);
            }
            Payload::Separated(ptr) => {
                buf.push(SEPARATED_TAG);
                let _ = buf.write_u64::<LittleEndian>(ptr.offset);
                let _ = buf.write_u32::<LittleEndian>(ptr.size);
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    pub fn decode(d: &mut Decoder<'_>) -> Result<Self> {
        let ts = d.u64()?;
        let key = d.short_str()?;
        let tag = d.u8()?;
        let payload = if tag == SEPARATED_TAG {
            let offset = d.u64()?;
            let size = d.u32()?;
            Payload::Separated(ValuePointer { offset, size })
        } else {
            let kind = ValueKind::from_tag(tag)?;
            let len = d.u32()? as usize;
            Payload::Inline(Value::from_raw(kind, d.take(len)?)?)
        };
        Ok(Self { ts, key, payload })
    }

    /// Decodes a buffer holding exactly one entry.
    pub fn decode_from(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let entry = Self::decode(&mut d)?;
        if !d.is_empty() {
            return Err(Error::corrupt(format!(
                "{} trailing bytes after entry",
                d.remaining()
            )));
        }
        Ok(entry)
    }
}

use byteorder::{LittleEndian, WriteBytesExt};

use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::KEY_SIZE;

/// Inclusive key bounds of one SSTable file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: String,
    pub end: String,
}

impl KeyRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        let range = Self {
            start: start.into(),
            end: end.into(),
        };
        debug_assert!(range.start <= range.end, "inverted key range {:?}", range);
        range
    }

    pub fn contains(&self, key: &str) -> bool {
        self.start.as_str() <= key && key <= self.end.as_str()
    }

    pub fn overlaps(&self, start: &str, end: &str) -> bool {
        self.start.as_str() <= end && start <= self.end.as_str()
    }

    /// Widens `self` to cover `other`.
    pub fn extend(&mut self, other: &KeyRange) {
        if other.start < self.start {
            self.start = other.start.clone();
        }
        if other.end > self.end {
            self.end = other.end.clone();
        }
    }

    /// Footer form: `[start_len: u16][start][end_len: u16][end]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.start.len() + self.end.len());
        let _ = buf.write_u16::<LittleEndian>(self.start.len() as u16);
        buf.extend_from_slice(self.start.as_bytes());
        let _ = buf.write_u16::<LittleEndian>(self.end.len() as u16);
        buf.extend_from_slice(self.end.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        let start = d.short_str()?;
        let end = d.short_str()?;
        if start > end {
            return Err(Error::corrupt(format!("inverted key range {start:?}..{end:?}")));
        }
        Ok(Self { start, end })
    }
}

/// Writes `key` zero-padded to [`KEY_SIZE`] bytes (manifest record form).
pub fn write_fixed_key(buf: &mut Vec<u8>, key: &str) -> Result<()> {
    if key.len() > KEY_SIZE {
        return Err(Error::ExceedMaxKeySize {
            size: key.len(),
            max: KEY_SIZE,
        });
    }
    buf.extend_from_slice(key.as_bytes());
    buf.resize(buf.len() + KEY_SIZE - key.len(), 0);
    Ok(())
}

/// Reverses [`write_fixed_key`]; keys never contain NUL so padding is unambiguous.
pub fn read_fixed_key(raw: &[u8]) -> Result<String> {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..len].to_vec()).map_err(|_| Error::corrupt("manifest key is not utf-8"))
}

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// On-disk type tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Bool = 0,
    Int = 1,
    Float = 2,
    String = 3,
    Bytes = 4,
    Tombstone = 5,
}

impl ValueKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Bool,
            1 => Self::Int,
            2 => Self::Float,
            3 => Self::String,
            4 => Self::Bytes,
            5 => Self::Tombstone,
            other => return Err(Error::UnknownValueType(other)),
        })
    }

    /// Payload width for fixed-size kinds, `None` for variable-length ones.
    fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool => Some(1),
            Self::Int | Self::Float => Some(8),
            Self::Tombstone => Some(0),
            Self::String | Self::Bytes => None,
        }
    }
}

/// A typed value. A logical delete is a `Tombstone`, never a removal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Tombstone,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Tombstone => ValueKind::Tombstone,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    /// Length of the raw payload, without tag or length prefix.
    pub fn raw_len(&self) -> usize {
        match self {
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len(),
            Value::Bytes(b) => b.len(),
            Value::Tombstone => 0,
        }
    }

    /// Appends the raw payload to `buf`.
    pub fn write_raw(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Bool(b) => buf.push(u8::from(*b)),
            Value::Int(i) => buf.extend_from_slice(&i.to_le_bytes()),
            Value::Float(f) => buf.extend_from_slice(&f.to_bits().to_le_bytes()),
            Value::String(s) => buf.extend_from_slice(s.as_bytes()),
            Value::Bytes(b) => buf.extend_from_slice(b),
            Value::Tombstone => {}
        }
    }

    /// Rebuilds a value from its tag and raw payload.
    ///
    /// Fixed-width kinds must be given exactly their width.
    pub fn from_raw(kind: ValueKind, raw: &[u8]) -> Result<Self> {
        if let Some(expected) = kind.fixed_width() {
            if raw.len() != expected {
                return Err(Error::IncorrectValueSize {
                    kind,
                    expected,
                    actual: raw.len(),
                });
            }
        }
        Ok(match kind {
            ValueKind::Bool => Value::Bool(raw[0] != 0),
            ValueKind::Int => Value::Int(LittleEndian::read_i64(raw)),
            ValueKind::Float => Value::Float(f64::from_bits(LittleEndian::read_u64(raw))),
            ValueKind::String => Value::String(
                String::from_utf8(raw.to_vec()).map_err(|_| Error::corrupt("string value is not utf-8"))?,
            ),
            ValueKind::Bytes => Value::Bytes(raw.to_vec()),
            ValueKind::Tombstone => Value::Tombstone,
        })
    }

    /// Self-describing form used in the value log: `[tag][raw payload]`.
    pub fn to_tagged(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.raw_len());
        buf.push(self.kind().tag());
        self.write_raw(&mut buf);
        buf
    }

    pub fn from_tagged(buf: &[u8]) -> Result<Self> {
        let (&tag, raw) = buf.split_first().ok_or(Error::ReadUnexpectedBytes {
            expected: 1,
            actual: 0,
        })?;
        Self::from_raw(ValueKind::from_tag(tag)?, raw)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(other.incompatible(ValueKind::Bool)),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.incompatible(ValueKind::Int)),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            other => Err(other.incompatible(ValueKind::Float)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(other.incompatible(ValueKind::String)),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            other => Err(other.incompatible(ValueKind::Bytes)),
        }
    }

    fn incompatible(&self, expected: ValueKind) -> Error {
        Error::IncompatibleValue {
            expected,
            found: self.kind(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

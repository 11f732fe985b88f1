use std::io;

use thiserror::Error;

use crate::value::ValueKind;

/// Errors shared by every layer of the engine.
///
/// Decode/encode and filesystem errors propagate to the immediate caller
/// unchanged. `TxnAbort` is always surfaced; the caller owns the retry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("key already exists")]
    KeyAlreadyExists,

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("key too large: {size} bytes (max {max})")]
    ExceedMaxKeySize { size: usize, max: usize },

    #[error("value too large: {size} bytes (max {max})")]
    ExceedMaxValueSize { size: usize, max: usize },

    #[error("field name too large: {size} bytes (max {max})")]
    ExceedMaxFieldNameSize { size: usize, max: usize },

    /// A fixed-width value was decoded from a payload of the wrong length.
    #[error("incorrect value size for {kind:?}: expected {expected} bytes, got {actual}")]
    IncorrectValueSize {
        kind: ValueKind,
        expected: usize,
        actual: usize,
    },

    /// A value was read as a type it does not hold.
    #[error("incompatible value: expected {expected:?}, found {found:?}")]
    IncompatibleValue { expected: ValueKind, found: ValueKind },

    #[error("unknown value type tag {0:#04x}")]
    UnknownValueType(u8),

    /// A write moved fewer bytes than requested.
    #[error("unexpected write: expected {expected} bytes, wrote {actual}")]
    WriteUnexpectedBytes { expected: usize, actual: usize },

    /// A read or decode ran out of bytes before the record was complete.
    #[error("unexpected read: expected {expected} bytes, got {actual}")]
    ReadUnexpectedBytes { expected: usize, actual: usize },

    /// An encoded entry does not fit into a single SSTable block.
    #[error("entry of {size} bytes does not fit a {block_size}-byte block")]
    IncorrectBlockSize { size: usize, block_size: usize },

    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Optimistic conflict detected at commit time.
    #[error("transaction aborted due to a conflicting commit")]
    TxnAbort,

    #[error("write attempted in a read-only transaction")]
    ReadOnlyTxn,

    /// A background task the call depends on has shut down.
    #[error("engine is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Returns `true` for the error kinds that mean "nothing stored under
    /// this key" rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

//! # Codec - shared types and binary encodings
//!
//! Every layer of the engine speaks in terms of the types defined here:
//!
//! - [`Entry`]: one immutable version of a key (`ts`, `key`, [`Payload`]).
//! - [`Value`]: the closed set of value types, including `Tombstone`.
//! - [`KeyRange`]: inclusive bounds of one SSTable file.
//! - [`Fields`]: a record's named fields, packed into a single `Bytes` value.
//! - [`Error`]: the error taxonomy shared by all crates.
//!
//! All integers are little-endian. Keys are UTF-8, non-empty, free of NUL
//! bytes and at most [`KEY_SIZE`] bytes long (manifests store them
//! zero-padded to that width).

mod decoder;
mod entry;
mod error;
mod range;
mod row;
mod value;

pub use decoder::Decoder;
pub use entry::{Entry, Payload, ValuePointer};
pub use error::{Error, Result};
pub use range::{read_fixed_key, write_fixed_key, KeyRange};
pub use row::{decode_fields, encode_fields, Fields, MAX_FIELD_NAME_SIZE};
pub use value::{Value, ValueKind};

/// Maximum key length in bytes; also the fixed key width in manifests.
pub const KEY_SIZE: usize = 64;

/// Checks a user key against the format's constraints.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty"));
    }
    if key.len() > KEY_SIZE {
        return Err(Error::ExceedMaxKeySize {
            size: key.len(),
            max: KEY_SIZE,
        });
    }
    if key.as_bytes().contains(&0) {
        return Err(Error::InvalidKey("key must not contain NUL bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests;

//! Optimistic transactions.
//!
//! A [`Txn`] reads from the snapshot it was started at and buffers its
//! writes locally. Nothing is visible to other transactions until the
//! oracle accepts the commit; a rejected commit surfaces as
//! [`Error::TxnAbort`] and the caller decides whether to retry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use codec::{validate_key, Error, Result, Value};

use crate::storage::Storage;

pub struct Txn {
    storage: Arc<Storage>,
    start_ts: u64,
    read_only: bool,
    max_value_size: usize,
    /// Key -> snapshot the key was observed at.
    read_set: HashMap<String, u64>,
    /// Pending writes; a delete is a `Tombstone`.
    writes: BTreeMap<String, Value>,
}

impl Txn {
    pub(crate) fn new(storage: Arc<Storage>, start_ts: u64, read_only: bool, max_value_size: usize) -> Self {
        Self {
            storage,
            start_ts,
            read_only,
            max_value_size,
            read_set: HashMap::new(),
            writes: BTreeMap::new(),
        }
    }

    /// Snapshot timestamp: the transaction sees commits older than this.
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Reads `key`, seeing this transaction's own pending writes.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] if the key is absent or deleted.
    pub fn read(&mut self, key: &str) -> Result<Value> {
        if let Some(v) = self.writes.get(key) {
            return match v {
                Value::Tombstone => Err(Error::KeyNotFound),
                v => Ok(v.clone()),
            };
        }
        validate_key(key)?;
        self.read_set.insert(key.to_string(), self.start_ts);
        self.storage
            .get(key, self.start_ts)?
            .ok_or(Error::KeyNotFound)
    }

    /// Live pairs in `[start, end]`, in key order, overlaid with this
    /// transaction's pending writes.
    pub fn scan(&mut self, start: &str, end: &str) -> Result<Vec<(String, Value)>> {
        let mut merged: BTreeMap<String, Value> = self
            .storage
            .scan(start, end, self.start_ts)?
            .into_iter()
            .collect();
        for key in merged.keys() {
            self.read_set.insert(key.clone(), self.start_ts);
        }
        if start <= end {
            for (key, value) in self.writes.range(start.to_string()..=end.to_string()) {
                match value {
                    Value::Tombstone => merged.remove(key),
                    v => merged.insert(key.clone(), v.clone()),
                };
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Buffers a write of `value` under `key`.
    pub fn write(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyTxn);
        }
        validate_key(key)?;
        let value = value.into();
        if value.raw_len() > self.max_value_size {
            return Err(Error::ExceedMaxValueSize {
                size: value.raw_len(),
                max: self.max_value_size,
            });
        }
        self.writes.insert(key.to_string(), value);
        Ok(())
    }

    /// Buffers a delete of `key`. Deleting an absent key is not an error.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyTxn);
        }
        validate_key(key)?;
        self.writes.insert(key.to_string(), Value::Tombstone);
        Ok(())
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Read and write sets in the shape the oracle validates.
    pub(crate) fn into_commit(self) -> (Vec<(String, u64)>, Vec<(String, Value)>) {
        (
            self.read_set.into_iter().collect(),
            self.writes.into_iter().collect(),
        )
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("start_ts", &self.start_ts)
            .field("read_only", &self.read_only)
            .field("reads", &self.read_set.len())
            .field("writes", &self.writes.len())
            .finish()
    }
}

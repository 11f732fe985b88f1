//! # MemTable
//!
//! The mutable generation of the tree: an [`AvlTree`] index paired with the
//! write-ahead log that makes it durable.
//!
//! Every write is appended to the WAL (and fsynced when `sync` is set)
//! **before** the index is touched. If the append fails the index is left
//! unchanged and the error is returned, so callers can retry.
//!
//! Readers take a shared lock on the index and never block each other.
//! Writers are serialized on the WAL.
//!
//! ## WAL naming
//!
//! A memtable with id `n` logs to `WAL_{n}` inside the memtable directory.
//! Ids only grow, so the newest WAL is the one with the largest id.

mod avl;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use codec::{Entry, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};
use wal::{WalReader, WalRecord, WalWriter};

pub use avl::AvlTree;

const WAL_PREFIX: &str = "WAL_";

/// File name of the WAL for memtable `id`.
pub fn wal_file_name(id: u64) -> String {
    format!("{}{}", WAL_PREFIX, id)
}

/// Parses a memtable id out of a `WAL_{id}` file name.
pub fn parse_wal_id(name: &str) -> Option<u64> {
    name.strip_prefix(WAL_PREFIX)?.parse().ok()
}

pub struct MemTable {
    id: u64,
    path: PathBuf,
    index: RwLock<AvlTree>,
    wal: Mutex<WalWriter>,
    /// Encoded bytes of every version accepted so far.
    size: AtomicUsize,
}

impl MemTable {
    /// Creates an empty memtable with a fresh `WAL_{id}` in `dir`.
    pub fn create(dir: &Path, id: u64, sync: bool) -> Result<Self> {
        let path = dir.join(wal_file_name(id));
        // a leftover file under a fresh id would mix two generations
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let wal = WalWriter::create(&path, sync)?;
        debug!(id, path = %path.display(), "created memtable");
        Ok(Self {
            id,
            path,
            index: RwLock::new(AvlTree::new()),
            wal: Mutex::new(wal),
            size: AtomicUsize::new(0),
        })
    }

    /// Rebuilds memtable `id` by replaying its WAL from byte 0.
    ///
    /// Returns the memtable, ready for further appends, and the greatest
    /// timestamp found in the log (0 for an empty log).
    pub fn recover_wal(dir: &Path, id: u64, sync: bool) -> Result<(Self, u64)> {
        let path = dir.join(wal_file_name(id));
        let mut index = AvlTree::new();
        let mut size = 0;
        let mut max_ts = 0;

        let mut reader = WalReader::open(&path)?;
        reader.replay(|record| {
            for entry in record.into_entries() {
                max_ts = max_ts.max(entry.ts);
                size += entry.encoded_len();
                index.insert(entry);
            }
        })?;

        // later appends must not land behind a torn frame
        let valid = reader.valid_len();
        let file = fs::OpenOptions::new().write(true).open(&path)?;
        if file.metadata()?.len() > valid {
            warn!(id, valid, "truncating torn WAL tail");
            file.set_len(valid)?;
            file.sync_all()?;
        }
        drop(file);

        let wal = WalWriter::create(&path, sync)?;
        debug!(
            id,
            keys = index.len(),
            versions = index.num_versions(),
            max_ts,
            "recovered memtable from wal"
        );
        let table = Self {
            id,
            path,
            index: RwLock::new(index),
            wal: Mutex::new(wal),
            size: AtomicUsize::new(size),
        };
        Ok((table, max_ts))
    }

    /// Logs and then indexes one entry.
    pub fn put(&self, entry: Entry) -> Result<()> {
        let mut wal = self.wal.lock();
        let record = WalRecord::Put(entry);
        wal.append(&record)?;
        let mut index = self.index.write();
        for entry in record.into_entries() {
            self.size.fetch_add(entry.encoded_len(), Ordering::Relaxed);
            index.insert(entry);
        }
        Ok(())
    }

    /// Logs `entries` as one record and then indexes all of them.
    ///
    /// Recovery sees either every entry of the batch or none.
    pub fn batch_put(&self, entries: Vec<Entry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut wal = self.wal.lock();
        let record = WalRecord::Batch(entries);
        wal.append(&record)?;
        let mut index = self.index.write();
        for entry in record.into_entries() {
            self.size.fetch_add(entry.encoded_len(), Ordering::Relaxed);
            index.insert(entry);
        }
        Ok(())
    }

    /// Newest version of `key` visible at `snapshot` (tombstones included).
    pub fn get(&self, key: &str, snapshot: u64) -> Option<Entry> {
        self.index.read().get(key, snapshot).cloned()
    }

    /// Visible version of every key in `[start, end]`, in key order.
    pub fn range(&self, start: &str, end: &str, snapshot: u64) -> Vec<Entry> {
        self.index.read().range(start, end, snapshot)
    }

    /// Every stored version, in SSTable order.
    pub fn entries(&self) -> Vec<Entry> {
        self.index.read().entries()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn wal_path(&self) -> &Path {
        &self.path
    }

    /// Approximate footprint: the encoded size of all versions.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Flushes and fsyncs the WAL regardless of the `sync` setting.
    pub fn sync(&self) -> Result<()> {
        self.wal.lock().sync_to_disk()?;
        Ok(())
    }

    /// Deletes the WAL once the contents are durable elsewhere.
    pub fn remove_wal(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Context;
use codec::{Error, Fields, Result, Value};
use config::Config;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::level::LevelStats;
use crate::oracle::Oracle;
use crate::storage::Storage;
use crate::txn::Txn;

/// Point-in-time numbers of a [`Db`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
    pub levels: Vec<LevelStats>,
    /// Memtables (active included) holding data not yet in L0.
    pub memtables: usize,
    pub vlog_head: u64,
    pub vlog_tail: u64,
    /// Timestamp the next transaction or commit will receive.
    pub next_ts: u64,
}

/// An open database directory.
///
/// Every read and write runs inside a transaction. [`Db::view_txn`] and
/// [`Db::update_txn`] expose them directly; the record helpers (`insert`,
/// `update`, `delete`, `read`, `scan`) wrap one transaction each and store a
/// record's [`Fields`] as one value.
pub struct Db {
    dir: PathBuf,
    config: Config,
    storage: Arc<Storage>,
    oracle: Oracle,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Db {
    /// Opens `dir`, creating it if needed, and recovers every level, the
    /// value log and all WALs.
    pub fn open(dir: impl AsRef<Path>, config: Config) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate()?;
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let (storage, next_ts, flush_rx) = Storage::open(&dir, config.clone())?;
        let storage = Arc::new(storage);
        let flusher = storage
            .spawn_flusher(flush_rx)
            .context("failed to start flusher")?;
        let oracle = Oracle::start(Arc::clone(&storage), next_ts, config.oracle_window)
            .context("failed to start oracle")?;

        info!(dir = %dir.display(), next_ts, "database open");
        Ok(Self {
            dir,
            config,
            storage,
            oracle,
            flusher: Mutex::new(Some(flusher)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `f` in a read-only transaction.
    pub fn view_txn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn) -> Result<T>,
    {
        let mut txn = self.begin(true)?;
        f(&mut txn)
    }

    /// Runs `f` in a read-write transaction and commits it if `f` succeeds.
    ///
    /// # Errors
    ///
    /// [`Error::TxnAbort`] if a key `f` read was committed by someone else
    /// in the meantime. Nothing was written; run a fresh transaction to
    /// retry.
    pub fn update_txn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Txn) -> Result<T>,
    {
        let mut txn = self.begin(false)?;
        let out = f(&mut txn)?;
        let (read_set, writes) = txn.into_commit();
        self.oracle.commit(read_set, writes)?;
        Ok(out)
    }

    /// Starts a transaction for callers that drive it by hand. Commit it
    /// with [`Db::commit`].
    pub fn begin(&self, read_only: bool) -> Result<Txn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let start_ts = self.oracle.begin()?;
        Ok(Txn::new(
            Arc::clone(&self.storage),
            start_ts,
            read_only,
            self.config.max_value_size,
        ))
    }

    /// Commits a transaction started with [`Db::begin`]. Returns the commit
    /// timestamp, or `None` if it wrote nothing.
    pub fn commit(&self, txn: Txn) -> Result<Option<u64>> {
        let (read_set, writes) = txn.into_commit();
        self.oracle.commit(read_set, writes)
    }

    /// Stores a new record.
    ///
    /// # Errors
    ///
    /// [`Error::KeyAlreadyExists`] if `key` holds a live record.
    pub fn insert(&self, key: &str, fields: Fields) -> Result<()> {
        self.update_txn(|txn| match txn.read(key) {
            Ok(_) => Err(Error::KeyAlreadyExists),
            Err(e) if e.is_not_found() => txn.write(key, Value::row(&fields)?),
            Err(e) => Err(e),
        })
    }

    /// Overlays `fields` on an existing record; fields not named keep their
    /// values.
    ///
    /// # Errors
    ///
    /// [`Error::KeyNotFound`] if `key` holds no live record.
    pub fn update(&self, key: &str, fields: Fields) -> Result<()> {
        self.update_txn(|txn| {
            let mut record = txn.read(key)?.as_row()?;
            record.extend(fields);
            txn.write(key, Value::row(&record)?)
        })
    }

    /// Deletes a record. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.update_txn(|txn| match txn.read(key) {
            Ok(_) => txn.delete(key),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        })
    }

    /// Reads the named fields of a record; an empty `fields` reads them all.
    pub fn read(&self, key: &str, fields: &[&str]) -> Result<Fields> {
        self.view_txn(|txn| Ok(project(txn.read(key)?.as_row()?, fields)))
    }

    /// Records with keys in `[start, end]`, in key order, projected to
    /// `fields`.
    pub fn scan(&self, start: &str, end: &str, fields: &[&str]) -> Result<Vec<(String, Fields)>> {
        self.view_txn(|txn| {
            txn.scan(start, end)?
                .into_iter()
                .map(|(key, value)| Ok((key, project(value.as_row()?, fields))))
                .collect()
        })
    }

    pub fn stats(&self) -> Result<DbStats> {
        let vlog = self.storage.vlog();
        Ok(DbStats {
            levels: self.storage.lsm().stats(),
            memtables: self.storage.num_memtables(),
            vlog_head: vlog.head(),
            vlog_tail: vlog.tail(),
            next_ts: self.oracle.peek()?,
        })
    }

    /// Freezes the active memtable and writes it to L0 now.
    pub fn force_flush(&self) -> anyhow::Result<()> {
        self.storage.force_flush()
    }

    /// Pushes every idle file of `level` one level down. Returns once the
    /// request is queued; the merge runs on the level's control thread.
    pub fn force_compact(&self, level: usize) -> Result<()> {
        self.storage.lsm().force_compact(level)
    }

    /// Stops background work and syncs the logs. Later calls do nothing.
    ///
    /// Data still in memtables stays in their WALs and is replayed on the
    /// next open.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.oracle.shutdown();
        if let Some(handle) = self.flusher.lock().take() {
            self.storage.stop_flusher(handle);
        }
        self.storage.lsm().shutdown();
        self.storage.sync()?;
        info!(dir = %self.dir.display(), "database closed");
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "failed to close database cleanly");
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("dir", &self.dir)
            .field("storage", &self.storage)
            .finish()
    }
}

/// Keeps the named fields of `record`; names it lacks are skipped.
fn project(mut record: Fields, fields: &[&str]) -> Fields {
    if fields.is_empty() {
        return record;
    }
    fields
        .iter()
        .filter_map(|name| record.remove_entry(*name))
        .collect()
}

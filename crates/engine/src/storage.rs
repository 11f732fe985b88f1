//! # Storage
//!
//! Glue between the write path and the tree:
//!
//! ```text
//!             apply(entries)
//!                  |
//!     large values |---> value log (pointer back)
//!                  v
//!        active memtable (WAL_n) --full--> immutables --flusher--> L0
//! ```
//!
//! Reads consult the active memtable, then the immutables newest first,
//! then the LSM; the first source holding a visible version wins. A frozen
//! memtable stays readable until its L0 file is registered, then its WAL is
//! deleted.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use codec::{Entry, Payload, Result, Value, ValuePointer};
use config::Config;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use memtable::{parse_wal_id, MemTable};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use vlog::ValueLog;

use crate::lsm::{keep_newest, Lsm};

/// Directory holding the `WAL_{id}` files.
pub const MEMTABLE_DIR: &str = "memtables";

/// Directory holding the value log.
pub const VLOG_DIR: &str = "VLog";

pub(crate) enum FlushSignal {
    Flush,
    Shutdown,
}

struct MemState {
    active: Arc<MemTable>,
    /// Frozen memtables waiting for the flusher, oldest first.
    immutables: Vec<Arc<MemTable>>,
}

pub struct Storage {
    config: Config,
    mem_dir: PathBuf,
    mem: RwLock<MemState>,
    vlog: ValueLog,
    lsm: Lsm,
    flush_tx: Sender<FlushSignal>,
    flush_lock: Mutex<()>,
}

impl Storage {
    /// Opens the value log and the LSM under `dir` and replays every WAL.
    /// Returns the storage, the first unused timestamp, and the flusher's
    /// signal queue.
    pub(crate) fn open(dir: &Path, config: Config) -> anyhow::Result<(Self, u64, Receiver<FlushSignal>)> {
        let mem_dir = dir.join(MEMTABLE_DIR);
        let vlog_dir = dir.join(VLOG_DIR);
        fs::create_dir_all(&mem_dir)
            .with_context(|| format!("failed to create {}", mem_dir.display()))?;
        fs::create_dir_all(&vlog_dir)
            .with_context(|| format!("failed to create {}", vlog_dir.display()))?;

        let vlog = ValueLog::open(&vlog_dir, config.sync_writes).context("failed to open value log")?;
        let lsm = Lsm::open(dir, config.clone()).context("failed to open levels")?;
        let mut max_ts = lsm.max_ts();

        let mut ids = Vec::new();
        for dent in fs::read_dir(&mem_dir)? {
            let dent = dent?;
            if let Some(id) = parse_wal_id(&dent.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut recovered = Vec::with_capacity(ids.len());
        for id in &ids {
            let (mem, ts) = MemTable::recover_wal(&mem_dir, *id, config.sync_writes)
                .with_context(|| format!("failed to recover WAL {}", id))?;
            debug!(wal = id, keys = mem.len(), max_ts = ts, "replayed WAL");
            max_ts = max_ts.max(ts);
            recovered.push(Arc::new(mem));
        }
        let active = match recovered.pop() {
            Some(mem) => mem,
            None => Arc::new(MemTable::create(&mem_dir, 1, config.sync_writes)?),
        };

        let (flush_tx, flush_rx) = bounded(16);
        let storage = Self {
            config,
            mem_dir,
            mem: RwLock::new(MemState {
                active,
                immutables: recovered,
            }),
            vlog,
            lsm,
            flush_tx,
            flush_lock: Mutex::new(()),
        };
        storage
            .flush_pending()
            .context("failed to flush recovered memtables")?;

        info!(
            wals = ids.len(),
            next_ts = max_ts + 1,
            vlog_head = storage.vlog.head(),
            "storage recovered"
        );
        Ok((storage, max_ts + 1, flush_rx))
    }

    pub fn lsm(&self) -> &Lsm {
        &self.lsm
    }

    pub fn vlog(&self) -> &ValueLog {
        &self.vlog
    }

    /// Number of memtables (active included) still holding unflushed data.
    pub fn num_memtables(&self) -> usize {
        1 + self.mem.read().immutables.len()
    }

    /// Durably applies one commit's entries.
    ///
    /// Large values go to the value log first; the entries then reach the
    /// WAL as one batch, so a crash keeps all of them or none.
    ///
    /// Once the batch is logged the commit has happened: a failed rotation
    /// is only logged, and the next `apply` or flusher tick retries it.
    pub(crate) fn apply(&self, entries: Vec<Entry>) -> Result<()> {
        let entries = self.separate(entries)?;
        self.mem.read().active.batch_put(entries)?;
        self.rotate_if_full();
        Ok(())
    }

    fn rotate_if_full(&self) {
        if let Err(e) = self.rotate(false) {
            warn!(error = %e, "failed to rotate full memtable; will retry");
        }
    }

    fn separate(&self, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let threshold = self.config.value_threshold;
        let is_large = |e: &Entry| e.value().map_or(false, |v| !v.is_tombstone() && v.raw_len() > threshold);
        if !entries.iter().any(is_large) {
            return Ok(entries);
        }

        let (large, mut out): (Vec<Entry>, Vec<Entry>) = entries.into_iter().partition(is_large);
        let tagged: Vec<(String, Vec<u8>)> = large
            .iter()
            .filter_map(|e| e.value().map(|v| (e.key.clone(), v.to_tagged())))
            .collect();
        let items: Vec<(&str, &[u8])> = tagged
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
            .collect();
        let ptrs = self.vlog.append_batch(&items)?;
        out.extend(
            large
                .into_iter()
                .zip(ptrs)
                .map(|(e, ptr)| Entry::separated(e.key, e.ts, ptr)),
        );
        Ok(out)
    }

    /// Freezes the active memtable behind a fresh one and wakes the flusher.
    /// Without `force`, only a full memtable is frozen.
    fn rotate(&self, force: bool) -> Result<()> {
        let mut state = self.mem.write();
        if state.active.is_empty() {
            return Ok(());
        }
        if !force && state.active.size() < self.config.memtable_size {
            return Ok(());
        }
        let id = state.active.id() + 1;
        let fresh = Arc::new(MemTable::create(&self.mem_dir, id, self.config.sync_writes)?);
        let frozen = std::mem::replace(&mut state.active, fresh);
        info!(
            memtable = frozen.id(),
            bytes = frozen.size(),
            keys = frozen.len(),
            "memtable frozen"
        );
        state.immutables.push(frozen);
        drop(state);

        // a queued signal already covers this one
        let _ = self.flush_tx.try_send(FlushSignal::Flush);
        Ok(())
    }

    /// Writes every frozen memtable to L0, oldest first, deleting each WAL
    /// once its file is registered.
    pub fn flush_pending(&self) -> anyhow::Result<()> {
        let _guard = self.flush_lock.lock();
        loop {
            let next = self.mem.read().immutables.first().cloned();
            let mem = match next {
                Some(mem) => mem,
                None => return Ok(()),
            };
            let entries = mem.entries();
            if !entries.is_empty() {
                self.lsm
                    .flush(entries)
                    .with_context(|| format!("failed to flush memtable {}", mem.id()))?;
            }
            self.mem.write().immutables.retain(|m| m.id() != mem.id());
            if let Err(e) = mem.remove_wal() {
                warn!(memtable = mem.id(), error = %e, "failed to remove flushed WAL");
            }
        }
    }

    /// Freezes the active memtable regardless of size and flushes it.
    pub fn force_flush(&self) -> anyhow::Result<()> {
        self.rotate(true).context("failed to rotate memtable")?;
        self.flush_pending()
    }

    /// Starts the background flusher fed by `rx`.
    pub(crate) fn spawn_flusher(self: &Arc<Self>, rx: Receiver<FlushSignal>) -> std::io::Result<JoinHandle<()>> {
        let storage = Arc::clone(self);
        thread::Builder::new()
            .name("memtable-flusher".into())
            .spawn(move || storage.run_flusher(rx))
    }

    fn run_flusher(&self, rx: Receiver<FlushSignal>) {
        // retries a flush that failed
        let ticker = tick(self.config.compaction_interval);
        loop {
            select! {
                recv(rx) -> sig => match sig {
                    Ok(FlushSignal::Flush) => {}
                    Ok(FlushSignal::Shutdown) | Err(_) => break,
                },
                recv(ticker) -> _ => self.rotate_if_full(),
            }
            if let Err(e) = self.flush_pending() {
                error!(error = ?e, "memtable flush failed; will retry");
            }
        }
        debug!("flusher stopped");
    }

    /// Stops the flusher thread behind `handle`.
    pub(crate) fn stop_flusher(&self, handle: JoinHandle<()>) {
        if self.flush_tx.send(FlushSignal::Shutdown).is_err() {
            warn!("flusher already stopped");
        }
        if handle.join().is_err() {
            warn!("flusher thread panicked");
        }
    }

    /// Newest value of `key` visible at `snapshot`; `None` if absent or
    /// deleted.
    pub fn get(&self, key: &str, snapshot: u64) -> Result<Option<Value>> {
        let entry = match self.find_entry(key, snapshot)? {
            Some(e) => e,
            None => return Ok(None),
        };
        match entry.payload {
            Payload::Inline(Value::Tombstone) => Ok(None),
            Payload::Inline(v) => Ok(Some(v)),
            Payload::Separated(ptr) => self.resolve(ptr).map(Some),
        }
    }

    fn find_entry(&self, key: &str, snapshot: u64) -> Result<Option<Entry>> {
        let (active, immutables) = self.memtables();
        if let Some(e) = active.get(key, snapshot) {
            return Ok(Some(e));
        }
        for mem in immutables.iter().rev() {
            if let Some(e) = mem.get(key, snapshot) {
                return Ok(Some(e));
            }
        }
        self.lsm.find(key, snapshot)
    }

    /// Live key/value pairs in `[start, end]` visible at `snapshot`, in key
    /// order.
    pub fn scan(&self, start: &str, end: &str, snapshot: u64) -> Result<Vec<(String, Value)>> {
        // memtables before levels: a flush in between registers its file
        // before it drops the memtable, so every entry is seen at least once
        let (active, immutables) = self.memtables();
        let mut newest: BTreeMap<String, Entry> = BTreeMap::new();
        for e in self.lsm.range(start, end, snapshot)? {
            keep_newest(&mut newest, e);
        }
        for mem in immutables.iter().chain(std::iter::once(&active)) {
            for e in mem.range(start, end, snapshot) {
                keep_newest(&mut newest, e);
            }
        }

        let live: Vec<Entry> = newest.into_values().filter(|e| !e.is_tombstone()).collect();
        let ptrs: Vec<ValuePointer> = live.iter().filter_map(|e| e.pointer()).collect();
        let mut resolved = self
            .vlog
            .get_many(&ptrs)?
            .into_iter()
            .map(|raw| Value::from_tagged(&raw));

        let mut out = Vec::with_capacity(live.len());
        for e in live {
            let value = match e.payload {
                Payload::Inline(v) => v,
                Payload::Separated(_) => match resolved.next() {
                    Some(v) => v?,
                    None => return Err(codec::Error::corrupt("value log returned too few values")),
                },
            };
            out.push((e.key, value));
        }
        Ok(out)
    }

    fn resolve(&self, ptr: ValuePointer) -> Result<Value> {
        Value::from_tagged(&self.vlog.get(ptr)?)
    }

    fn memtables(&self) -> (Arc<MemTable>, Vec<Arc<MemTable>>) {
        let state = self.mem.read();
        (Arc::clone(&state.active), state.immutables.clone())
    }

    /// Fsyncs the active WAL and the value log.
    pub fn sync(&self) -> Result<()> {
        self.mem.read().active.sync()?;
        self.vlog.sync()
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.mem.read();
        f.debug_struct("Storage")
            .field("active", &state.active.id())
            .field("immutables", &state.immutables.len())
            .field("vlog", &self.vlog)
            .field("lsm", &self.lsm)
            .finish()
    }
}

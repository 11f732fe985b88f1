//! # LSM coordinator
//!
//! Owns the levels L0..L6 as a flat array, the SSTable file pool and the
//! file-id counter. Each level gets one control thread (`compaction.rs`)
//! that serialises every structural change to that level.
//!
//! ## Read path
//!
//! `find` probes levels top-down and stops at the first level that yields a
//! visible version; inside a level the candidate files are read concurrently
//! and the newest reply wins. `range` fans out to every level and keeps the
//! newest visible version of each key.
//!
//! A file can vanish between listing it and reading it when a merge retires
//! it. Such a failure is ignored and the level is listed again: the merge
//! registers its output before deleting its inputs.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use codec::{Entry, Error, Result};
use config::{Config, NUM_LEVELS};
use parking_lot::Mutex;
use sstable::FilePool;
use tracing::{debug, info, warn};

use crate::level::{remove_if_exists, Level, LevelRequest, LevelStats};

pub(crate) struct LsmInner {
    pub(crate) dir: PathBuf,
    pub(crate) config: Config,
    pub(crate) levels: Vec<Level>,
    pub(crate) pool: Arc<FilePool>,
    next_file_id: AtomicU64,
}

impl LsmInner {
    pub(crate) fn next_file_id(&self) -> u64 {
        self.next_file_id.fetch_add(1, Ordering::AcqRel)
    }
}

pub struct Lsm {
    inner: Arc<LsmInner>,
    controls: Mutex<Vec<JoinHandle<()>>>,
}

impl Lsm {
    /// Opens (or creates) every level under `dir` and starts their control
    /// threads.
    pub fn open(dir: &Path, config: Config) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let pool = Arc::new(FilePool::new(config.file_workers)?);

        let mut levels = Vec::with_capacity(NUM_LEVELS);
        let mut receivers = Vec::with_capacity(NUM_LEVELS);
        for n in 0..NUM_LEVELS {
            let threshold = (n == 0).then_some(config.l0_compact_threshold);
            let (level, rx) = Level::open(dir, n, config.level_capacity(n), threshold, &pool)?;
            levels.push(level);
            receivers.push(rx);
        }
        resolve_duplicates(&levels)?;

        let max_id = levels
            .iter()
            .flat_map(|l| l.file_ids())
            .max()
            .unwrap_or(0);
        let inner = Arc::new(LsmInner {
            dir: dir.to_path_buf(),
            config,
            levels,
            pool,
            next_file_id: AtomicU64::new(max_id + 1),
        });

        let mut controls = Vec::with_capacity(NUM_LEVELS);
        for (n, rx) in receivers.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("level-{}", n))
                .spawn(move || inner.run_control(n, rx))?;
            controls.push(handle);
        }

        info!(
            dir = %dir.display(),
            files = inner.levels.iter().map(|l| l.num_files()).sum::<usize>(),
            next_file_id = max_id + 1,
            "opened lsm"
        );
        Ok(Self {
            inner,
            controls: Mutex::new(controls),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn level(&self, n: usize) -> Option<&Level> {
        self.inner.levels.get(n)
    }

    /// Highest commit timestamp stored in any file.
    pub fn max_ts(&self) -> u64 {
        self.inner.levels.iter().map(|l| l.max_ts()).max().unwrap_or(0)
    }

    pub fn stats(&self) -> Vec<LevelStats> {
        self.inner.levels.iter().map(|l| l.stats()).collect()
    }

    /// Newest version of `key` visible at `snapshot`, tombstones included.
    pub fn find(&self, key: &str, snapshot: u64) -> Result<Option<Entry>> {
        for level in &self.inner.levels {
            loop {
                let ids = level.find_sst_files(key);
                if ids.is_empty() {
                    break;
                }
                let tickets: Vec<_> = ids
                    .into_iter()
                    .map(|id| {
                        let t = self.inner.pool.find(level.file_path(id), key.to_string(), snapshot);
                        (id, t)
                    })
                    .collect();

                let mut best: Option<Entry> = None;
                let mut stale = false;
                for (id, ticket) in tickets {
                    match ticket.wait() {
                        Ok(Some(e)) => {
                            if best.as_ref().map_or(true, |b| e.ts > b.ts) {
                                best = Some(e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) if !level.contains(id) => {
                            debug!(level = level.number(), file = id, error = %e, "file retired during read");
                            stale = true;
                        }
                        Err(e) => return Err(e),
                    }
                }
                if best.is_some() {
                    return Ok(best);
                }
                if !stale {
                    break;
                }
            }
        }
        Ok(None)
    }

    /// Newest version of every key in `[start, end]` visible at `snapshot`,
    /// tombstones included, in key order.
    pub fn range(&self, start: &str, end: &str, snapshot: u64) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(Vec::new());
        }
        'retry: loop {
            let mut tickets = Vec::new();
            for level in &self.inner.levels {
                for id in level.range_sst_files(start, end) {
                    let t = self.inner.pool.range(
                        level.file_path(id),
                        start.to_string(),
                        end.to_string(),
                        snapshot,
                    );
                    tickets.push((level, id, t));
                }
            }

            let mut newest: BTreeMap<String, Entry> = BTreeMap::new();
            for (level, id, ticket) in tickets {
                let entries = match ticket.wait() {
                    Ok(entries) => entries,
                    Err(e) if !level.contains(id) => {
                        debug!(level = level.number(), file = id, error = %e, "file retired during scan");
                        continue 'retry;
                    }
                    Err(e) => return Err(e),
                };
                for e in entries {
                    keep_newest(&mut newest, e);
                }
            }
            return Ok(newest.into_values().collect());
        }
    }

    /// Writes `entries` (sorted, as produced by a memtable) to a new L0
    /// file and registers it.
    pub fn flush(&self, entries: Vec<Entry>) -> anyhow::Result<u64> {
        let inner = &self.inner;
        let id = inner.next_file_id();
        let l0 = &inner.levels[0];
        let count = entries.len();
        let meta = inner
            .pool
            .write(l0.file_path(id), inner.config.block_size, entries)
            .wait()
            .with_context(|| format!("failed to write L0 file {}", id))?;
        let bytes = meta.size;
        l0.new_sst_file(id, meta)
            .with_context(|| format!("failed to register L0 file {}", id))?;
        info!(file = id, entries = count, bytes, "flushed memtable to L0");
        Ok(id)
    }

    /// Asks level `n` to push all of its idle files one level down.
    pub fn force_compact(&self, n: usize) -> Result<()> {
        let level = self
            .inner
            .levels
            .get(n)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no level {}", n)))?;
        level
            .sender()
            .send(LevelRequest::Compact { force: true })
            .map_err(|_| Error::Closed)
    }

    /// Stops the control threads top-down, then the file pool. Idempotent.
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.controls.lock());
        if handles.is_empty() {
            return;
        }
        for (level, handle) in self.inner.levels.iter().zip(handles) {
            let _ = level.sender().send(LevelRequest::Shutdown);
            if handle.join().is_err() {
                warn!(level = level.number(), "level control thread panicked");
            }
        }
        self.inner.pool.shutdown();
        debug!("lsm shut down");
    }
}

impl Drop for Lsm {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Lsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lsm")
            .field("dir", &self.inner.dir)
            .field("levels", &self.inner.levels)
            .finish()
    }
}

pub(crate) fn keep_newest(newest: &mut BTreeMap<String, Entry>, e: Entry) {
    match newest.get(&e.key) {
        Some(cur) if cur.ts >= e.ts => {}
        _ => {
            newest.insert(e.key.clone(), e);
        }
    }
}

/// A file named by two adjacent manifests is a transplant that crashed
/// half-way: the lower level already owns it, so the upper copy goes.
fn resolve_duplicates(levels: &[Level]) -> Result<()> {
    for n in 1..levels.len() {
        let (upper, lower) = (&levels[n - 1], &levels[n]);
        let dups: Vec<u64> = upper
            .file_ids()
            .into_iter()
            .filter(|id| lower.contains(*id))
            .collect();
        if dups.is_empty() {
            continue;
        }
        warn!(level = n - 1, files = ?dups, "finishing interrupted transplant");
        upper.forget(&dups);
        upper.update_manifest()?;
        for id in dups {
            remove_if_exists(&upper.file_path(id))?;
        }
    }
    Ok(())
}

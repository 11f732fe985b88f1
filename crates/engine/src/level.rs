//! One level of the tree: a directory of SSTables plus the in-memory view of
//! its manifest.
//!
//! Reads (`find_sst_files`, `range_sst_files`) take the table lock shared.
//! Structural changes take it exclusively and are issued by the level's
//! control task (see `compaction.rs`) or by the flusher for L0.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bloom::BloomFilter;
use codec::{KeyRange, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use sstable::{parse_sst_id, sst_file_name, FilePool, Interval, TableMeta};
use tracing::{debug, info, warn};

use crate::manifest::{self, MANIFEST_NEW_FILENAME};

/// Directory name of level `n`.
pub fn level_dir_name(n: usize) -> String {
    format!("L{}", n)
}

/// Requests served by a level's control task.
#[derive(Debug)]
pub(crate) enum LevelRequest {
    /// Merge `files` of level `from` into this level.
    Merge { from: usize, files: Vec<u64> },
    /// Forward every idle file of this level to the level below.
    Compact { force: bool },
    Shutdown,
}

#[derive(Debug, Clone)]
pub(crate) struct FileMeta {
    pub range: KeyRange,
    pub size: u64,
    pub max_ts: u64,
}

#[derive(Default)]
struct Tables {
    files: BTreeMap<u64, FileMeta>,
    blooms: HashMap<u64, BloomFilter>,
    /// Files handed to a merge that has not finished yet.
    merging: HashSet<u64>,
}

/// Point-in-time numbers of one level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelStats {
    pub level: usize,
    pub files: usize,
    pub bytes: u64,
    pub capacity: u64,
}

pub struct Level {
    number: usize,
    dir: PathBuf,
    capacity: u64,
    /// File count that makes L0 ask for a compaction.
    compact_threshold: Option<usize>,
    tables: RwLock<Tables>,
    size: AtomicU64,
    /// In-memory state differs from the manifest on disk.
    dirty: AtomicBool,
    persist_lock: Mutex<()>,
    tx: Sender<LevelRequest>,
}

impl Level {
    /// Opens `L{number}` under `root`, creating it if needed, and loads every
    /// file its manifest names. Returns the receiving end of the level's
    /// request queue for its control task.
    pub(crate) fn open(
        root: &Path,
        number: usize,
        capacity: u64,
        compact_threshold: Option<usize>,
        pool: &FilePool,
    ) -> Result<(Self, Receiver<LevelRequest>)> {
        let dir = root.join(level_dir_name(number));
        fs::create_dir_all(&dir)?;
        remove_if_exists(&dir.join(MANIFEST_NEW_FILENAME))?;

        let listed = manifest::load(&dir)?;
        let mut tables = Tables::default();
        let mut dirty = false;
        let mut tickets = Vec::with_capacity(listed.len());
        for (id, range) in listed {
            let path = dir.join(sst_file_name(id));
            if !path.exists() {
                warn!(level = number, file = id, "manifest names a missing file; dropping it");
                dirty = true;
                continue;
            }
            tickets.push((id, range, pool.read_meta(path)));
        }
        for (id, range, ticket) in tickets {
            let TableMeta {
                range: stored,
                bloom,
                size,
                max_ts,
            } = ticket.wait()?;
            if stored != range {
                warn!(level = number, file = id, "manifest range disagrees with file footer");
                dirty = true;
            }
            tables.files.insert(id, FileMeta { range: stored, size, max_ts });
            tables.blooms.insert(id, bloom);
        }

        // anything not in the manifest is an unfinished write or a leftover
        for dent in fs::read_dir(&dir)? {
            let dent = dent?;
            let name = dent.file_name();
            let name = name.to_string_lossy();
            let orphan = match parse_sst_id(&name) {
                Some(id) => !tables.files.contains_key(&id),
                None => name.ends_with(".tmp"),
            };
            if orphan {
                info!(level = number, file = %name, "removing orphaned file");
                remove_if_exists(&dent.path())?;
            }
        }

        let size = tables.files.values().map(|m| m.size).sum();
        let (tx, rx) = unbounded();
        let level = Self {
            number,
            dir,
            capacity,
            compact_threshold,
            tables: RwLock::new(tables),
            size: AtomicU64::new(size),
            dirty: AtomicBool::new(dirty),
            persist_lock: Mutex::new(()),
            tx,
        };
        debug!(
            level = number,
            files = level.num_files(),
            bytes = size,
            "opened level"
        );
        Ok((level, rx))
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total bytes of the level's files.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn num_files(&self) -> usize {
        self.tables.read().files.len()
    }

    pub fn file_path(&self, id: u64) -> PathBuf {
        self.dir.join(sst_file_name(id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.tables.read().files.contains_key(&id)
    }

    pub fn file_ids(&self) -> Vec<u64> {
        self.tables.read().files.keys().copied().collect()
    }

    pub fn max_ts(&self) -> u64 {
        self.tables
            .read()
            .files
            .values()
            .map(|m| m.max_ts)
            .max()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> LevelStats {
        let t = self.tables.read();
        LevelStats {
            level: self.number,
            files: t.files.len(),
            bytes: t.files.values().map(|m| m.size).sum(),
            capacity: self.capacity,
        }
    }

    pub(crate) fn sender(&self) -> &Sender<LevelRequest> {
        &self.tx
    }

    /// Registers a durable file and persists the manifest. On L0, reaching
    /// the compaction threshold queues a `Compact` for the control task.
    pub(crate) fn new_sst_file(&self, id: u64, meta: TableMeta) -> Result<()> {
        let count = {
            let mut t = self.tables.write();
            t.files.insert(
                id,
                FileMeta {
                    range: meta.range,
                    size: meta.size,
                    max_ts: meta.max_ts,
                },
            );
            t.blooms.insert(id, meta.bloom);
            t.files.len()
        };
        self.size.fetch_add(meta.size, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
        self.update_manifest()?;

        if let Some(threshold) = self.compact_threshold {
            if count >= threshold {
                debug!(level = self.number, files = count, "compaction threshold reached");
                // the control task may already be gone during shutdown
                let _ = self.tx.send(LevelRequest::Compact { force: false });
            }
        }
        Ok(())
    }

    /// Files whose range holds `key` and whose bloom filter does not rule it
    /// out, newest first.
    pub fn find_sst_files(&self, key: &str) -> Vec<u64> {
        let t = self.tables.read();
        t.files
            .iter()
            .rev()
            .filter(|(id, meta)| {
                meta.range.contains(key)
                    && t.blooms
                        .get(id)
                        .map_or(true, |b| b.may_contain(key.as_bytes()))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Files whose range intersects `[start, end]`.
    pub fn range_sst_files(&self, start: &str, end: &str) -> Vec<u64> {
        self.tables
            .read()
            .files
            .iter()
            .filter(|(_, meta)| meta.range.overlaps(start, end))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drops `ids` from the level, persists the manifest, then unlinks the
    /// files. A crash in between leaves orphans, never dangling entries.
    pub(crate) fn delete_sst_files(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let removed = self.forget(ids);
        self.update_manifest()?;
        for id in removed {
            remove_if_exists(&self.file_path(id))?;
        }
        Ok(())
    }

    /// Drops `ids` from the in-memory tables only. Returns the ids that were
    /// present.
    pub(crate) fn forget(&self, ids: &[u64]) -> Vec<u64> {
        let mut t = self.tables.write();
        let mut removed = Vec::with_capacity(ids.len());
        let mut bytes = 0;
        for id in ids {
            t.merging.remove(id);
            t.blooms.remove(id);
            if let Some(meta) = t.files.remove(id) {
                bytes += meta.size;
                removed.push(*id);
            }
        }
        drop(t);
        self.size.fetch_sub(bytes, Ordering::AcqRel);
        if !removed.is_empty() {
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Key ranges of the given files, skipping ids the level does not hold.
    pub(crate) fn ranges_of(&self, ids: &[u64]) -> Vec<(u64, KeyRange)> {
        let t = self.tables.read();
        ids.iter()
            .filter_map(|id| t.files.get(id).map(|m| (*id, m.range.clone())))
            .collect()
    }

    /// One interval per file that is not part of a running merge.
    pub(crate) fn idle_intervals(&self) -> Vec<Interval> {
        let t = self.tables.read();
        t.files
            .iter()
            .filter(|(id, _)| !t.merging.contains(id))
            .map(|(id, meta)| Interval::new(meta.range.clone(), *id))
            .collect()
    }

    /// Marks `ids` as merging. Returns their total size.
    pub(crate) fn mark_merging(&self, ids: &[u64]) -> u64 {
        let mut t = self.tables.write();
        let mut bytes = 0;
        for id in ids {
            if let Some(meta) = t.files.get(id) {
                bytes += meta.size;
            }
            t.merging.insert(*id);
        }
        bytes
    }

    pub(crate) fn clear_merging(&self, ids: &[u64]) {
        let mut t = self.tables.write();
        for id in ids {
            t.merging.remove(id);
        }
    }

    /// Writes the current file set to the manifest.
    pub fn update_manifest(&self) -> Result<()> {
        let _guard = self.persist_lock.lock();
        self.dirty.store(false, Ordering::Release);
        let records: Vec<(u64, KeyRange)> = {
            let t = self.tables.read();
            t.files
                .iter()
                .map(|(id, meta)| (*id, meta.range.clone()))
                .collect()
        };
        let res = manifest::save(&self.dir, records.iter().map(|(id, r)| (*id, r)));
        if res.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        res
    }

    /// Persists the manifest if it lags the in-memory state.
    pub(crate) fn persist_if_dirty(&self) {
        if !self.dirty.load(Ordering::Acquire) {
            return;
        }
        match self.update_manifest() {
            Ok(()) => debug!(level = self.number, "manifest persisted"),
            Err(e) => warn!(level = self.number, error = %e, "failed to persist manifest"),
        }
    }
}

impl std::fmt::Debug for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Level")
            .field("number", &self.number)
            .field("dir", &self.dir)
            .field("files", &self.num_files())
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

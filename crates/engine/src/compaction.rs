//! # Compaction
//!
//! Every level runs one control thread. It is the only code that decides
//! what moves out of its level and the only code that merges files into
//! it, so those decisions are strictly ordered per level.
//!
//! ## Triggers
//!
//! - **Capacity**: on every tick of `compaction_interval`, a level whose size
//!   exceeds its capacity picks idle files, oldest interval first, until the
//!   excess is covered, and sends them to the level below.
//! - **L0 file count**: registering an L0 file that brings the count to
//!   `l0_compact_threshold` queues a `Compact`, which forwards every idle L0
//!   file to L1.
//!
//! ## Merge
//!
//! The receiving level coalesces the incoming files with its own
//! overlapping idle files into disjoint intervals. For each interval that
//! contains incoming files:
//!
//! ```text
//! one file     -> transplant: hard-link into L{n+1}, register below,
//!                 unregister above, unlink above
//! many files   -> k-way merge into one new file, register it, then
//!                 delete every input from its level
//! ```
//!
//! A failed merge is logged and its files are released so the next
//! capacity check can pick them again. Nothing is surfaced to foreground
//! callers.
//!
//! Versions are never dropped here: duplicates of one `(key, ts)` collapse,
//! older versions of a key survive and are skipped at read time.

use std::collections::HashSet;
use std::fs;

use anyhow::{Context, Result};
use config::NUM_LEVELS;
use crossbeam_channel::{select, tick, Receiver};
use sstable::{merge_intervals, merge_sort, Interval};
use tracing::{debug, error, info, warn};

use crate::level::{remove_if_exists, Level, LevelRequest};
use crate::lsm::LsmInner;

impl LsmInner {
    /// Body of level `n`'s control thread.
    pub(crate) fn run_control(&self, n: usize, rx: Receiver<LevelRequest>) {
        let ticker = tick(self.config.compaction_interval);
        debug!(level = n, "level control started");
        loop {
            select! {
                recv(rx) -> req => match req {
                    Ok(LevelRequest::Merge { from, files }) => self.merge_into(n, from, files),
                    Ok(LevelRequest::Compact { force }) => self.compact_level(n, force),
                    Ok(LevelRequest::Shutdown) | Err(_) => break,
                },
                recv(ticker) -> _ => {
                    self.check_capacity(n);
                    self.levels[n].persist_if_dirty();
                }
            }
        }
        self.levels[n].persist_if_dirty();
        debug!(level = n, "level control stopped");
    }

    /// Sends enough idle files of level `n` down to bring it back under
    /// capacity.
    pub(crate) fn check_capacity(&self, n: usize) {
        if n + 1 >= NUM_LEVELS {
            return;
        }
        let level = &self.levels[n];
        let size = level.size();
        if size <= level.capacity() {
            return;
        }

        let mut intervals = merge_intervals(level.idle_intervals());
        // oldest data first: file ids grow monotonically
        intervals.sort_by_key(|iv| iv.files.iter().copied().min().unwrap_or(u64::MAX));

        let mut excess = size - level.capacity();
        let mut chosen = Vec::new();
        for iv in intervals {
            if excess == 0 {
                break;
            }
            excess = excess.saturating_sub(level.mark_merging(&iv.files));
            chosen.extend(iv.files);
        }
        if chosen.is_empty() {
            return;
        }
        info!(
            level = n,
            size,
            capacity = level.capacity(),
            files = chosen.len(),
            "level over capacity; compacting down"
        );
        self.send_down(n, chosen);
    }

    /// Forwards every idle file of level `n` to the level below. Without
    /// `force`, L0 only does so while it holds `l0_compact_threshold` idle
    /// files.
    pub(crate) fn compact_level(&self, n: usize, force: bool) {
        if n + 1 >= NUM_LEVELS {
            debug!(level = n, "bottom level does not compact");
            return;
        }
        let level = &self.levels[n];
        let files: Vec<u64> = level
            .idle_intervals()
            .into_iter()
            .flat_map(|iv| iv.files)
            .collect();
        if !force && n == 0 && files.len() < self.config.l0_compact_threshold {
            // an earlier request already took these files
            return;
        }
        if files.is_empty() {
            return;
        }
        level.mark_merging(&files);
        info!(level = n, files = files.len(), "compacting level");
        self.send_down(n, files);
    }

    fn send_down(&self, n: usize, files: Vec<u64>) {
        let below = &self.levels[n + 1];
        if below
            .sender()
            .send(LevelRequest::Merge { from: n, files: files.clone() })
            .is_err()
        {
            warn!(level = n + 1, "level control is gone; releasing files");
            self.levels[n].clear_merging(&files);
        }
    }

    /// Merges `files` from level `from` into level `target`.
    pub(crate) fn merge_into(&self, target: usize, from: usize, files: Vec<u64>) {
        let upper = &self.levels[from];
        let lower = &self.levels[target];

        let incoming = upper.ranges_of(&files);
        let incoming_ids: HashSet<u64> = incoming.iter().map(|(id, _)| *id).collect();
        let lost: Vec<u64> = files
            .iter()
            .copied()
            .filter(|id| !incoming_ids.contains(id))
            .collect();
        if !lost.is_empty() {
            warn!(level = from, files = ?lost, "merge request names unknown files");
            upper.clear_merging(&lost);
        }

        let mut intervals: Vec<Interval> = incoming
            .into_iter()
            .map(|(id, range)| Interval::new(range, id))
            .collect();
        intervals.extend(lower.idle_intervals());

        for group in merge_intervals(intervals) {
            let (moving, resident): (Vec<u64>, Vec<u64>) =
                group.files.iter().copied().partition(|id| incoming_ids.contains(id));
            if moving.is_empty() {
                continue;
            }
            lower.mark_merging(&resident);

            let res = if moving.len() == 1 && resident.is_empty() {
                self.transplant(upper, lower, moving[0])
            } else {
                self.rewrite(upper, lower, &moving, &resident)
            };
            if let Err(e) = res {
                error!(
                    from,
                    target,
                    files = ?group.files,
                    error = ?e,
                    "merge failed; files released for retry"
                );
                upper.clear_merging(&moving);
                lower.clear_merging(&resident);
            }
        }
    }

    /// Moves one file down a level without rewriting it.
    fn transplant(&self, upper: &Level, lower: &Level, id: u64) -> Result<()> {
        let src = upper.file_path(id);
        let dst = lower.file_path(id);
        remove_if_exists(&dst)?;
        fs::hard_link(&src, &dst)
            .with_context(|| format!("failed to link {} to {}", src.display(), dst.display()))?;
        let meta = self
            .pool
            .read_meta(dst.clone())
            .wait()
            .with_context(|| format!("failed to read {}", dst.display()))?;

        if let Err(e) = lower.new_sst_file(id, meta) {
            lower.forget(&[id]);
            remove_if_exists(&dst)?;
            return Err(e).context("failed to register transplanted file");
        }
        upper
            .delete_sst_files(&[id])
            .with_context(|| format!("failed to retire L{} file {}", upper.number(), id))?;
        debug!(file = id, from = upper.number(), to = lower.number(), "transplanted file");
        Ok(())
    }

    /// Merges `moving` (from `upper`) and `resident` (already in `lower`)
    /// into one new file of `lower`.
    fn rewrite(&self, upper: &Level, lower: &Level, moving: &[u64], resident: &[u64]) -> Result<()> {
        let tickets: Vec<_> = moving
            .iter()
            .map(|id| upper.file_path(*id))
            .chain(resident.iter().map(|id| lower.file_path(*id)))
            .map(|path| {
                let ticket = self.pool.read_all(path.clone());
                (path, ticket)
            })
            .collect();
        let mut runs = Vec::with_capacity(tickets.len());
        for (path, ticket) in tickets {
            runs.push(
                ticket
                    .wait()
                    .with_context(|| format!("failed to read {}", path.display()))?,
            );
        }
        let merged = merge_sort(runs);
        let count = merged.len();

        let id = self.next_file_id();
        let path = lower.file_path(id);
        let meta = self
            .pool
            .write(path.clone(), self.config.block_size, merged)
            .wait()
            .with_context(|| format!("failed to write {}", path.display()))?;
        let bytes = meta.size;
        lower
            .new_sst_file(id, meta)
            .with_context(|| format!("failed to register {}", path.display()))?;

        lower
            .delete_sst_files(resident)
            .context("failed to retire merged files below")?;
        upper
            .delete_sst_files(moving)
            .context("failed to retire merged files above")?;
        info!(
            from = upper.number(),
            to = lower.number(),
            inputs = moving.len() + resident.len(),
            output = id,
            entries = count,
            bytes,
            "merged files"
        );
        Ok(())
    }
}

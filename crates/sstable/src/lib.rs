//! # SSTable - Sorted String Table
//!
//! Immutable, on-disk storage files. A flushed memtable or a compaction
//! result is written once and only ever replaced, never modified.
//!
//! ## File layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ HEADER (40 bytes)                                              │
//! │ data_bytes | index_bytes | bloom_bytes | range_bytes | max_ts  │
//! ├────────────────────────────────────────────────────────────────┤
//! │ DATA (fixed-size blocks)                                       │
//! │ count (u16) | entry ... | zero padding                         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ INDEX (one entry per block)                                    │
//! │ key_len (u16) | last key of block | block number (u32)         │
//! ├────────────────────────────────────────────────────────────────┤
//! │ BLOOM (serialized BloomFilter over the file's keys)            │
//! ├────────────────────────────────────────────────────────────────┤
//! │ KEY RANGE                                                      │
//! │ start_len (u16) | start | end_len (u16) | end                  │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. Entries are sorted by key ascending and,
//! within one key, newest first; the versions of one key may span several
//! blocks.
//!
//! File access goes through [`FilePool`], which caps the number of files
//! open at once.

mod format;
mod merge;
mod pool;
mod reader;
mod writer;

pub use format::{Header, IndexEntry, HEADER_BYTES};
pub use merge::{merge_intervals, merge_sort, Interval};
pub use pool::{FilePool, Ticket};
pub use reader::SstReader;
pub use writer::{sync_dir, SstWriter, TableMeta};

/// Extension of finished table files.
pub const SST_EXTENSION: &str = "sst";

/// File name of table `id`.
pub fn sst_file_name(id: u64) -> String {
    format!("{}.{}", id, SST_EXTENSION)
}

/// Parses a table id out of a `{id}.sst` file name.
pub fn parse_sst_id(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}

#[cfg(test)]
mod tests;

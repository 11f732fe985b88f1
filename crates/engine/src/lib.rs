//! # Engine - Strata storage engine
//!
//! Ties the [`memtable`], [`vlog`] and [`sstable`] crates together into a
//! transactional LSM-tree store with key/value separation.
//!
//! ## Architecture
//!
//! ```text
//! Db::update_txn(f)                       Db::view_txn(f)
//!   |  reads at startTs, buffers writes     |  reads at startTs
//!   v                                       v
//! ┌───────────────────────────────────────────────────────────┐
//! │ Oracle (one thread): conflict check, commitTs = nextTs++  │
//! └───────────────────────────────────────────────────────────┘
//!   | apply(entries)
//!   v
//! ┌───────────────────────────────────────────────────────────┐
//! │ Storage                                                   │
//! │   large value ──► VLog/vlog.log          (pointer back)   │
//! │   batch ──► WAL_n ──► active MemTable                     │
//! │   full? ──► frozen MemTable ──flusher──► L0/{id}.sst      │
//! └───────────────────────────────────────────────────────────┘
//!   |
//!   v
//! ┌───────────────────────────────────────────────────────────┐
//! │ Lsm: L0 .. L6, one control thread each                    │
//! │   over capacity / L0 full ──► merge into the level below  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module         | Purpose                                                   |
//! |----------------|-----------------------------------------------------------|
//! | [`db`]         | `Db` façade: open/close, transactions, record helpers      |
//! | [`txn`]        | snapshot reads, buffered writes                            |
//! | [`oracle`]     | timestamps and commit validation                           |
//! | [`storage`]    | memtables, value separation, flusher, read merge           |
//! | [`lsm`]        | level array, point and range lookups across files          |
//! | `compaction`   | per-level control threads, transplant and k-way merge      |
//! | [`level`]      | one level's files, blooms and merge marks                  |
//! | [`manifest`]   | per-level manifest file (atomic replace)                   |
//!
//! ## On-disk Layout
//!
//! ```text
//! {dir}/
//!   memtables/WAL_{id}
//!   VLog/vlog.log
//!   L0/ .. L6/
//!     manifest
//!     {id}.sst
//! ```
//!
//! ## Crash Safety
//!
//! Values reach the value log before the WAL, and the WAL before the
//! memtable. A WAL is deleted only after its L0 file is registered in the
//! L0 manifest. SSTables and manifests are written to a scratch file,
//! fsynced and renamed. A merge registers its output before retiring its
//! inputs, so a crash leaves at worst orphaned files, which are removed on
//! the next open.

mod compaction;
pub mod db;
pub mod level;
pub mod lsm;
pub mod manifest;
pub mod oracle;
pub mod storage;
pub mod txn;

pub use codec::{Error, Fields, Result, Value};
pub use config::Config;
pub use db::{Db, DbStats};
pub use level::LevelStats;
pub use txn::Txn;

#[cfg(test)]
mod tests;

//! # Config - engine tuning knobs
//!
//! [`Config`] can be built three ways:
//!
//! - `Config::default()`: sensible defaults for an embedded node.
//! - `"...".parse::<Config>()`: a TOML document; missing keys keep defaults.
//! - [`Config::from_env`]: defaults overlaid with `STRATA_*` variables.
//!
//! ```text
//! STRATA_MEMTABLE_SIZE         rotate the memtable after this many bytes
//! STRATA_SYNC_WRITES           fsync WAL/value-log appends   (true|false)
//! STRATA_BLOCK_SIZE            SSTable data-block size in bytes
//! STRATA_MAX_VALUE_SIZE        largest accepted value in bytes
//! STRATA_VALUE_THRESHOLD       values larger than this go to the value log
//! STRATA_L0_COMPACT_THRESHOLD  L0 file count that triggers compaction
//! STRATA_L0_CAPACITY           L0 byte capacity
//! STRATA_LEVEL_MULTIPLIER      level n >= 1 holds 10^n times this many bytes
//! STRATA_COMPACTION_INTERVAL   capacity-check period, e.g. "500ms"
//! STRATA_FILE_WORKERS          SSTable file-worker pool size
//! STRATA_ORACLE_WINDOW         recently-committed write sets kept for conflicts
//! ```
//!
//! Format constants (key width, level count, bloom parameters) are not
//! configurable: changing them would change the on-disk layout.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Number of levels in the tree (L0..L6).
pub const NUM_LEVELS: usize = 7;

/// Bytes an inline entry needs besides its key and value payload:
/// ts (8) + key length (2) + tag (1) + payload length (4).
const ENTRY_OVERHEAD: usize = 8 + 2 + 1 + 4;

/// Block header: the entry count.
const BLOCK_OVERHEAD: usize = 2;

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Active memtable size (bytes) that triggers rotation and flush.
    pub memtable_size: usize,
    /// fsync every WAL and value-log append.
    pub sync_writes: bool,
    /// Fixed SSTable data-block size in bytes.
    pub block_size: usize,
    /// Largest accepted value, in bytes of raw payload.
    pub max_value_size: usize,
    /// Values whose raw payload exceeds this many bytes are stored in the
    /// value log and referenced by pointer.
    pub value_threshold: usize,
    /// L0 file count that triggers a compaction into L1.
    pub l0_compact_threshold: usize,
    /// L0 byte capacity.
    pub l0_capacity: u64,
    /// Level `i >= 1` holds `10^i * level_multiplier` bytes.
    pub level_multiplier: u64,
    /// Period of each level's capacity check and manifest persistence.
    #[serde(with = "humantime_serde")]
    pub compaction_interval: Duration,
    /// Number of threads serving SSTable file operations.
    pub file_workers: usize,
    /// Capacity of the oracle's recently-committed window.
    pub oracle_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memtable_size: 4 * 1024 * 1024,
            sync_writes: true,
            block_size: 4096,
            max_value_size: 1024 * 1024,
            value_threshold: 64,
            l0_compact_threshold: 4,
            l0_capacity: 8 * 1024 * 1024,
            level_multiplier: 1024 * 1024,
            compaction_interval: Duration::from_secs(1),
            file_workers: 16,
            oracle_window: 100_000,
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let c: Config = toml::from_str(s).context("failed to parse engine config")?;
        c.validate()?;
        Ok(c)
    }
}

impl Config {
    /// Defaults overlaid with any `STRATA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Config::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut c = Config::default();

        fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            raw.trim()
                .parse()
                .with_context(|| format!("invalid value for {}: {:?}", name, raw))
        }

        if let Some(v) = lookup("STRATA_MEMTABLE_SIZE") {
            c.memtable_size = parse("STRATA_MEMTABLE_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_SYNC_WRITES") {
            c.sync_writes = parse("STRATA_SYNC_WRITES", &v)?;
        }
        if let Some(v) = lookup("STRATA_BLOCK_SIZE") {
            c.block_size = parse("STRATA_BLOCK_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_MAX_VALUE_SIZE") {
            c.max_value_size = parse("STRATA_MAX_VALUE_SIZE", &v)?;
        }
        if let Some(v) = lookup("STRATA_VALUE_THRESHOLD") {
            c.value_threshold = parse("STRATA_VALUE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("STRATA_L0_COMPACT_THRESHOLD") {
            c.l0_compact_threshold = parse("STRATA_L0_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("STRATA_L0_CAPACITY") {
            c.l0_capacity = parse("STRATA_L0_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("STRATA_LEVEL_MULTIPLIER") {
            c.level_multiplier = parse("STRATA_LEVEL_MULTIPLIER", &v)?;
        }
        if let Some(v) = lookup("STRATA_COMPACTION_INTERVAL") {
            c.compaction_interval = humantime::parse_duration(v.trim())
                .with_context(|| format!("invalid value for STRATA_COMPACTION_INTERVAL: {:?}", v))?;
        }
        if let Some(v) = lookup("STRATA_FILE_WORKERS") {
            c.file_workers = parse("STRATA_FILE_WORKERS", &v)?;
        }
        if let Some(v) = lookup("STRATA_ORACLE_WINDOW") {
            c.oracle_window = parse("STRATA_ORACLE_WINDOW", &v)?;
        }

        c.validate()?;
        Ok(c)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.memtable_size > 0, "memtable_size must be > 0");
        ensure!(self.file_workers > 0, "file_workers must be > 0");
        ensure!(self.oracle_window > 0, "oracle_window must be > 0");
        ensure!(self.l0_compact_threshold > 0, "l0_compact_threshold must be > 0");
        ensure!(self.l0_capacity > 0 && self.level_multiplier > 0, "level capacities must be > 0");
        ensure!(
            !self.compaction_interval.is_zero(),
            "compaction_interval must be non-zero"
        );
        ensure!(
            self.value_threshold <= self.max_value_size,
            "value_threshold ({}) exceeds max_value_size ({})",
            self.value_threshold,
            self.max_value_size
        );
        let largest_inline = BLOCK_OVERHEAD + ENTRY_OVERHEAD + codec::KEY_SIZE + self.value_threshold.max(12);
        ensure!(
            self.block_size >= largest_inline,
            "block_size {} cannot hold an inline entry of {} bytes",
            self.block_size,
            largest_inline
        );
        Ok(())
    }

    /// Byte capacity of level `n`.
    pub fn level_capacity(&self, n: usize) -> u64 {
        if n == 0 {
            return self.l0_capacity;
        }
        10u64.saturating_pow(n as u32).saturating_mul(self.level_multiplier)
    }
}

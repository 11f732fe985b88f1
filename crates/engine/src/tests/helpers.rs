use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use codec::{Fields, Value};
use config::Config;

/// Small sizes so tests rotate memtables and fill levels quickly.
pub fn small_config() -> Config {
    Config {
        memtable_size: 16 * 1024,
        sync_writes: false,
        block_size: 1024,
        l0_compact_threshold: 4,
        compaction_interval: Duration::from_millis(20),
        file_workers: 4,
        ..Config::default()
    }
}

/// Like [`small_config`] but the background never compacts on its own.
pub fn quiet_config() -> Config {
    Config {
        l0_compact_threshold: usize::MAX,
        l0_capacity: u64::MAX,
        level_multiplier: u64::MAX,
        compaction_interval: Duration::from_secs(3600),
        ..small_config()
    }
}

pub fn row(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(name, v)| (name.to_string(), v.clone()))
        .collect()
}

pub fn count_sst_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|ext| ext == "sst")
                .unwrap_or(false)
        })
        .count()
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

//! # Manifest - per-level file registry
//!
//! Every level directory holds a `manifest` naming the SSTable files that
//! belong to the level and their key ranges. It is the authority on level
//! membership: a `.sst` file the manifest does not name is garbage.
//!
//! ## File Format
//!
//! A flat sequence of fixed-size records, one per file:
//!
//! ```text
//! [file_id: u64 BE][start_key: KEY_SIZE bytes][end_key: KEY_SIZE bytes]["\r\n"]
//! ```
//!
//! Keys are zero-padded to [`codec::KEY_SIZE`].
//!
//! ## Crash Safety
//!
//! The manifest is never edited in place. A new version is written to
//! `manifest_new`, fsynced and renamed over `manifest`; the directory is
//! fsynced after the rename. A leftover `manifest_new` is discarded on open.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use codec::{read_fixed_key, write_fixed_key, Error, KeyRange, Result, KEY_SIZE};

/// Name of the manifest file within a level directory.
pub const MANIFEST_FILENAME: &str = "manifest";

/// Scratch file used during atomic manifest writes.
pub const MANIFEST_NEW_FILENAME: &str = "manifest_new";

const RECORD_SEPARATOR: &[u8; 2] = b"\r\n";

/// Size of one manifest record in bytes.
pub const RECORD_BYTES: usize = 8 + 2 * KEY_SIZE + RECORD_SEPARATOR.len();

/// Reads the manifest in `dir`. A missing manifest is an empty level.
pub fn load(dir: &Path) -> Result<Vec<(u64, KeyRange)>> {
    let raw = match fs::read(dir.join(MANIFEST_FILENAME)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.len() % RECORD_BYTES != 0 {
        return Err(Error::corrupt(format!(
            "{}: manifest length {} is not a multiple of {}",
            dir.display(),
            raw.len(),
            RECORD_BYTES
        )));
    }

    raw.chunks_exact(RECORD_BYTES).map(decode_record).collect()
}

fn decode_record(rec: &[u8]) -> Result<(u64, KeyRange)> {
    let mut id = [0u8; 8];
    id.copy_from_slice(&rec[..8]);
    let start = read_fixed_key(&rec[8..8 + KEY_SIZE])?;
    let end = read_fixed_key(&rec[8 + KEY_SIZE..8 + 2 * KEY_SIZE])?;
    if &rec[8 + 2 * KEY_SIZE..] != RECORD_SEPARATOR {
        return Err(Error::corrupt("manifest record is missing its separator"));
    }
    if start > end {
        return Err(Error::corrupt(format!("manifest range {start:?}..{end:?} is inverted")));
    }
    Ok((u64::from_be_bytes(id), KeyRange { start, end }))
}

/// Atomically replaces the manifest in `dir` with `records`.
pub fn save<'a, I>(dir: &Path, records: I) -> Result<()>
where
    I: IntoIterator<Item = (u64, &'a KeyRange)>,
{
    let mut buf = Vec::new();
    for (id, range) in records {
        buf.extend_from_slice(&id.to_be_bytes());
        write_fixed_key(&mut buf, &range.start)?;
        write_fixed_key(&mut buf, &range.end)?;
        buf.extend_from_slice(RECORD_SEPARATOR);
    }

    let tmp_path = dir.join(MANIFEST_NEW_FILENAME);
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    let path = dir.join(MANIFEST_FILENAME);
    fs::rename(&tmp_path, &path)?;
    sstable::sync_dir(&path);
    Ok(())
}

use std::cmp::Ordering;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use bloom::BloomFilter;
use codec::{Entry, Error, KeyRange, Result};

use crate::format::{check_fits, encode_index, BlockBuilder, Header, IndexEntry};

/// What the owning level needs to know about a freshly written file.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub range: KeyRange,
    pub bloom: BloomFilter,
    /// File size in bytes.
    pub size: u64,
    pub max_ts: u64,
}

/// Writes sorted entries to disk as an immutable SSTable file.
///
/// The write is crash-safe: data goes to `{path}.tmp`, is fsynced, and is
/// then atomically renamed into place. A leftover `.tmp` file is garbage.
pub struct SstWriter;

impl SstWriter {
    /// Writes `entries` to `path` using `block_size`-byte data blocks.
    ///
    /// `entries` must be ordered by key ascending and, within a key, by
    /// timestamp descending ([`Entry::cmp_newest_first`]).
    ///
    /// # Errors
    ///
    /// - [`Error::IncorrectBlockSize`] if some entry cannot fit a block.
    /// - [`Error::Corrupt`] if `entries` is out of order.
    /// - An I/O error if `entries` is empty or the file cannot be written.
    pub fn write(path: &Path, block_size: usize, entries: &[Entry]) -> Result<TableMeta> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "refusing to write an empty SSTable",
                )))
            }
        };
        if let Some(w) = entries
            .windows(2)
            .find(|w| w[0].cmp_newest_first(&w[1]) == Ordering::Greater)
        {
            return Err(Error::corrupt(format!(
                "sstable input out of order at {:?}@{} / {:?}@{}",
                w[0].key, w[0].ts, w[1].key, w[1].ts
            )));
        }

        let mut bloom = BloomFilter::for_items(entries.len());
        let mut index: Vec<IndexEntry> = Vec::new();
        let mut data = Vec::new();
        let mut block = BlockBuilder::new(block_size);
        let mut max_ts = 0;
        let mut block_last_key: &str = &first.key;
        let mut prev_key: Option<&str> = None;

        for entry in entries {
            check_fits(entry, block_size)?;
            if !block.add(entry) {
                data.extend_from_slice(&block.finish());
                index.push(IndexEntry {
                    last_key: block_last_key.to_string(),
                    block: index.len() as u32,
                });
                if !block.add(entry) {
                    return Err(Error::IncorrectBlockSize {
                        size: entry.encoded_len(),
                        block_size,
                    });
                }
            }
            block_last_key = &entry.key;
            max_ts = max_ts.max(entry.ts);
            if prev_key != Some(entry.key.as_str()) {
                bloom.insert(entry.key.as_bytes());
                prev_key = Some(entry.key.as_str());
            }
        }
        if !block.is_empty() {
            data.extend_from_slice(&block.finish());
            index.push(IndexEntry {
                last_key: block_last_key.to_string(),
                block: index.len() as u32,
            });
        }

        let range = KeyRange::new(first.key.clone(), last.key.clone());
        let index_buf = encode_index(&index);
        let mut bloom_buf = Vec::with_capacity(bloom.serialized_size());
        bloom.write_to(&mut bloom_buf)?;
        let range_buf = range.encode();

        let header = Header {
            data_bytes: data.len() as u64,
            index_bytes: index_buf.len() as u64,
            bloom_bytes: bloom_buf.len() as u64,
            range_bytes: range_buf.len() as u64,
            max_ts,
        };

        let header_buf = header.encode();
        let sections: [&[u8]; 5] = [&header_buf, &data, &index_buf, &bloom_buf, &range_buf];

        let tmp_path = path.with_extension("sst.tmp");
        let result = write_file(&tmp_path, &sections).and_then(|()| fs::rename(&tmp_path, path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        sync_dir(path);

        Ok(TableMeta {
            range,
            bloom,
            size: header.file_size(),
            max_ts,
        })
    }
}

fn write_file(path: &Path, sections: &[&[u8]]) -> io::Result<()> {
    let raw = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut file = BufWriter::new(raw);
    for section in sections {
        file.write_all(section)?;
    }
    file.flush()?;
    file.into_inner().map_err(|e| e.into_error())?.sync_all()
}

/// Fsyncs the parent directory so a rename or unlink in it is durable.
///
/// Best effort: some platforms cannot open a directory for syncing.
pub fn sync_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bloom::BloomFilter;
use codec::{Entry, Error, KeyRange, Result};

use crate::format::{decode_block, decode_index, Header, IndexEntry, HEADER_BYTES};
use crate::writer::TableMeta;

/// An open SSTable file.
///
/// [`open`](SstReader::open) loads the header and the sparse index; blocks
/// are read on demand. Readers are short-lived: a file worker opens one,
/// serves a single request and drops it, which bounds the number of open
/// descriptors by the number of workers.
pub struct SstReader {
    path: PathBuf,
    header: Header,
    index: Vec<IndexEntry>,
    block_size: usize,
    file: BufReader<File>,
}

impl SstReader {
    /// Opens `path` and loads its header and index.
    ///
    /// # Validation
    ///
    /// - The file size must match the header's section sizes.
    /// - The data section must divide evenly into one block per index entry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut file = BufReader::new(file);

        let header = Header::decode(&read_section(&mut file, 0, HEADER_BYTES)?)?;
        if header.file_size() != file_len {
            return Err(Error::corrupt(format!(
                "{}: header describes {} bytes, file has {}",
                path.display(),
                header.file_size(),
                file_len
            )));
        }

        let index = decode_index(&read_section(&mut file, header.index_offset(), header.index_bytes)?)?;
        if index.is_empty() || header.data_bytes % index.len() as u64 != 0 {
            return Err(Error::corrupt(format!(
                "{}: {} data bytes do not split into {} blocks",
                path.display(),
                header.data_bytes,
                index.len()
            )));
        }
        let block_size = (header.data_bytes / index.len() as u64) as usize;

        Ok(Self {
            path,
            header,
            index,
            block_size,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn read_bloom(&mut self) -> Result<BloomFilter> {
        let raw = read_section(&mut self.file, self.header.bloom_offset(), self.header.bloom_bytes)?;
        let mut cursor = io::Cursor::new(raw);
        BloomFilter::read_from(&mut cursor)
            .map_err(|e| Error::corrupt(format!("{}: {}", self.path.display(), e)))
    }

    pub fn read_range(&mut self) -> Result<KeyRange> {
        let raw = read_section(&mut self.file, self.header.range_offset(), self.header.range_bytes)?;
        KeyRange::decode(&raw)
    }

    /// Everything the owning level caches about this file.
    pub fn meta(&mut self) -> Result<TableMeta> {
        Ok(TableMeta {
            range: self.read_range()?,
            bloom: self.read_bloom()?,
            size: self.header.file_size(),
            max_ts: self.header.max_ts,
        })
    }

    fn read_block(&mut self, block: usize) -> Result<Vec<Entry>> {
        let offset = HEADER_BYTES + (block * self.block_size) as u64;
        let raw = read_section(&mut self.file, offset, self.block_size as u64)?;
        decode_block(&raw)
    }

    /// First block whose last key is `>= key`.
    fn first_block_for(&self, key: &str) -> usize {
        self.index.partition_point(|e| e.last_key.as_str() < key)
    }

    /// Newest version of `key` with `ts < snapshot`, tombstones included.
    ///
    /// Versions of one key may continue into the following blocks, so the
    /// scan moves on while a block still ends with `key`.
    pub fn find(&mut self, key: &str, snapshot: u64) -> Result<Option<Entry>> {
        let mut block = self.first_block_for(key);
        while block < self.index.len() {
            for entry in self.read_block(block)? {
                if entry.key.as_str() > key {
                    return Ok(None);
                }
                if entry.key == key && entry.ts < snapshot {
                    return Ok(Some(entry));
                }
            }
            if self.index[block].last_key != key {
                break;
            }
            block += 1;
        }
        Ok(None)
    }

    /// Visible version of every key in `[start, end]`, in key order.
    pub fn range(&mut self, start: &str, end: &str, snapshot: u64) -> Result<Vec<Entry>> {
        let mut out: Vec<Entry> = Vec::new();
        if start > end {
            return Ok(out);
        }
        let mut block = self.first_block_for(start);
        while block < self.index.len() {
            for entry in self.read_block(block)? {
                let key = entry.key.as_str();
                if key < start || key > end || entry.ts >= snapshot {
                    continue;
                }
                // entries are newest first per key: keep the first visible one
                if out.last().map_or(false, |prev| prev.key == entry.key) {
                    continue;
                }
                out.push(entry);
            }
            if self.index[block].last_key.as_str() > end {
                break;
            }
            block += 1;
        }
        Ok(out)
    }

    /// Every entry in the file, in stored order.
    pub fn read_all(&mut self) -> Result<Vec<Entry>> {
        let raw = read_section(&mut self.file, HEADER_BYTES, self.header.data_bytes)?;
        let mut out = Vec::new();
        for chunk in raw.chunks(self.block_size) {
            out.extend(decode_block(chunk)?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("blocks", &self.index.len())
            .finish()
    }
}

/// Reads exactly `len` bytes at `offset`; a short file is
/// [`Error::ReadUnexpectedBytes`].
fn read_section(file: &mut BufReader<File>, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    let read = file.by_ref().take(len).read_to_end(&mut buf)?;
    if (read as u64) < len {
        return Err(Error::ReadUnexpectedBytes {
            expected: len as usize,
            actual: read,
        });
    }
    Ok(buf)
}

//! SSTable binary format: header, data blocks and sparse index.
//!
//! ## Header (40 bytes)
//!
//! ```text
//! [data_bytes: u64][index_bytes: u64][bloom_bytes: u64][range_bytes: u64][max_ts: u64]
//! ```
//!
//! ## Data block (`block_size` bytes)
//!
//! ```text
//! [count: u16][entry]*count[zero padding]
//! ```
//!
//! Entries use the [`codec::Entry`] encoding and never straddle two blocks.
//! The block size is not stored; it is `data_bytes / number_of_index_entries`.
//!
//! ## Index entry
//!
//! ```text
//! [key_len: u16][last_key_of_block][block: u32]
//! ```

use byteorder::{LittleEndian, WriteBytesExt};
use codec::{Decoder, Entry, Error, Result};

/// Size of the fixed header in bytes: five `u64` fields.
pub const HEADER_BYTES: u64 = 5 * 8;

/// Size of the per-block entry count.
pub const BLOCK_HEADER_BYTES: usize = 2;

/// Section sizes plus the newest timestamp stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub data_bytes: u64,
    pub index_bytes: u64,
    pub bloom_bytes: u64,
    pub range_bytes: u64,
    pub max_ts: u64,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_BYTES as usize] {
        let mut out = [0u8; HEADER_BYTES as usize];
        let fields = [
            self.data_bytes,
            self.index_bytes,
            self.bloom_bytes,
            self.range_bytes,
            self.max_ts,
        ];
        for (chunk, field) in out.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(buf);
        Ok(Self {
            data_bytes: d.u64()?,
            index_bytes: d.u64()?,
            bloom_bytes: d.u64()?,
            range_bytes: d.u64()?,
            max_ts: d.u64()?,
        })
    }

    pub fn index_offset(&self) -> u64 {
        HEADER_BYTES + self.data_bytes
    }

    pub fn bloom_offset(&self) -> u64 {
        self.index_offset() + self.index_bytes
    }

    pub fn range_offset(&self) -> u64 {
        self.bloom_offset() + self.bloom_bytes
    }

    /// Total file size the header describes.
    pub fn file_size(&self) -> u64 {
        self.range_offset() + self.range_bytes
    }
}

/// One sparse-index entry: the last key of a block and the block number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub last_key: String,
    pub block: u32,
}

pub fn encode_index(index: &[IndexEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    for e in index {
        let _ = buf.write_u16::<LittleEndian>(e.last_key.len() as u16);
        buf.extend_from_slice(e.last_key.as_bytes());
        let _ = buf.write_u32::<LittleEndian>(e.block);
    }
    buf
}

pub fn decode_index(buf: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut d = Decoder::new(buf);
    let mut index: Vec<IndexEntry> = Vec::new();
    while !d.is_empty() {
        let last_key = d.short_str()?;
        let block = d.u32()?;
        if let Some(prev) = index.last() {
            if prev.last_key > last_key || block != prev.block + 1 {
                return Err(Error::corrupt("sstable index out of order"));
            }
        } else if block != 0 {
            return Err(Error::corrupt("sstable index does not start at block 0"));
        }
        index.push(IndexEntry { last_key, block });
    }
    Ok(index)
}

/// Packs encoded entries into one fixed-size block.
#[derive(Debug)]
pub struct BlockBuilder {
    buf: Vec<u8>,
    count: u16,
    block_size: usize,
}

impl BlockBuilder {
    pub fn new(block_size: usize) -> Self {
        let mut buf = Vec::with_capacity(block_size);
        buf.extend_from_slice(&[0u8; BLOCK_HEADER_BYTES]);
        Self {
            buf,
            count: 0,
            block_size,
        }
    }

    /// Adds `entry` if it fits; returns `false` when the block is full.
    pub fn add(&mut self, entry: &Entry) -> bool {
        if self.buf.len() + entry.encoded_len() > self.block_size || self.count == u16::MAX {
            return false;
        }
        entry.encode_into(&mut self.buf);
        self.count += 1;
        true
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The finished block, zero-padded to `block_size`. Resets the builder.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut block = std::mem::replace(&mut self.buf, Vec::with_capacity(self.block_size));
        block[..BLOCK_HEADER_BYTES].copy_from_slice(&self.count.to_le_bytes());
        block.resize(self.block_size, 0);
        self.buf.extend_from_slice(&[0u8; BLOCK_HEADER_BYTES]);
        self.count = 0;
        block
    }
}

/// Fails with [`Error::IncorrectBlockSize`] if `entry` can never fit a block.
pub fn check_fits(entry: &Entry, block_size: usize) -> Result<()> {
    let size = BLOCK_HEADER_BYTES + entry.encoded_len();
    if size > block_size {
        return Err(Error::IncorrectBlockSize { size, block_size });
    }
    Ok(())
}

/// Decodes every entry of one block.
pub fn decode_block(raw: &[u8]) -> Result<Vec<Entry>> {
    let mut d = Decoder::new(raw);
    let count = d.u16()?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(Entry::decode(&mut d)?);
    }
    Ok(entries)
}

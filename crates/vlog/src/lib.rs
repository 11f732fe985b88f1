//! # VLog - value log
//!
//! Append-only file holding values too large to keep inline in the index.
//! The tree stores a [`ValuePointer`] instead, so compaction moves keys and
//! pointers but never rewrites the values themselves.
//!
//! ## Record Format
//!
//! ```text
//! [key_len: u16 LE][key][value_len: u32 LE][value]
//! ```
//!
//! A pointer addresses the value bytes of one record: `offset` is the position
//! of the first value byte and `size` is `value_len`. Offsets are never reused.
//!
//! All appends go through one writer lock. `head` is the next write offset;
//! `tail` is the lowest live offset and stays at 0 because nothing reclaims
//! space yet.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::{Error, Result, ValuePointer};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// File name of the log inside its directory.
pub const VLOG_FILE: &str = "vlog.log";

const RECORD_OVERHEAD: u64 = 2 + 4;

struct Writer {
    file: File,
    head: u64,
    /// Reusable scratch buffer for framing records.
    buf: Vec<u8>,
}

pub struct ValueLog {
    path: PathBuf,
    sync: bool,
    writer: Mutex<Writer>,
    reader: Mutex<BufReader<File>>,
    tail: u64,
}

impl ValueLog {
    /// Opens (or creates) `dir/vlog.log`.
    ///
    /// A record cut short by a crash is truncated away; nothing can point
    /// at it because pointers are only handed out after a complete append.
    pub fn open(dir: &Path, sync: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(VLOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let head = valid_prefix(&path, len)?;
        if head < len {
            warn!(path = %path.display(), len, head, "truncating torn value log tail");
            file.set_len(head)?;
            file.sync_all()?;
        }

        let reader = BufReader::new(File::open(&path)?);
        debug!(path = %path.display(), head, "opened value log");
        Ok(Self {
            path,
            sync,
            writer: Mutex::new(Writer {
                file,
                head,
                buf: Vec::with_capacity(256),
            }),
            reader: Mutex::new(reader),
            tail: 0,
        })
    }

    /// Appends one record and returns the pointer to its value.
    pub fn append(&self, key: &str, value: &[u8]) -> Result<ValuePointer> {
        let mut ptrs = self.append_batch(&[(key, value)])?;
        ptrs.pop()
            .ok_or_else(|| Error::corrupt("value log append produced no pointer"))
    }

    /// Appends several records with a single write and fsync.
    pub fn append_batch(&self, items: &[(&str, &[u8])]) -> Result<Vec<ValuePointer>> {
        let mut w = self.writer.lock();
        let start = w.head;
        let mut ptrs = Vec::with_capacity(items.len());

        w.buf.clear();
        for (key, value) in items {
            if value.len() > u32::MAX as usize {
                return Err(Error::ExceedMaxValueSize {
                    size: value.len(),
                    max: u32::MAX as usize,
                });
            }
            w.buf.write_u16::<LittleEndian>(key.len() as u16)?;
            w.buf.extend_from_slice(key.as_bytes());
            w.buf.write_u32::<LittleEndian>(value.len() as u32)?;
            ptrs.push(ValuePointer {
                offset: start + w.buf.len() as u64,
                size: value.len() as u32,
            });
            w.buf.extend_from_slice(value);
        }

        let written = w.buf.len() as u64;
        if let Err(e) = write_all_synced(&mut w, self.sync) {
            if let Err(trunc) = w.file.set_len(start) {
                warn!(error = %trunc, "failed to roll back partial value log append");
            }
            return Err(e.into());
        }
        w.head = start + written;
        Ok(ptrs)
    }

    /// Reads the value behind `ptr`.
    pub fn get(&self, ptr: ValuePointer) -> Result<Vec<u8>> {
        self.check(ptr)?;
        let mut r = self.reader.lock();
        read_at(&mut r, ptr)
    }

    /// Reads several values under one reader lock, in the order given.
    pub fn get_many(&self, ptrs: &[ValuePointer]) -> Result<Vec<Vec<u8>>> {
        for ptr in ptrs {
            self.check(*ptr)?;
        }
        let mut r = self.reader.lock();
        ptrs.iter().map(|ptr| read_at(&mut r, *ptr)).collect()
    }

    /// Next write offset.
    pub fn head(&self) -> u64 {
        self.writer.lock().head
    }

    /// Lowest live offset.
    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes and fsyncs regardless of the `sync` setting.
    pub fn sync(&self) -> Result<()> {
        let mut w = self.writer.lock();
        w.file.flush()?;
        w.file.sync_all()?;
        Ok(())
    }

    fn check(&self, ptr: ValuePointer) -> Result<()> {
        let head = self.head();
        if ptr.offset < self.tail || ptr.offset + u64::from(ptr.size) > head {
            return Err(Error::corrupt(format!(
                "value pointer {}+{} outside log [{}, {})",
                ptr.offset, ptr.size, self.tail, head
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ValueLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueLog")
            .field("path", &self.path)
            .field("head", &self.head())
            .field("tail", &self.tail)
            .finish()
    }
}

fn write_all_synced(w: &mut Writer, sync: bool) -> io::Result<()> {
    let Writer { file, buf, .. } = w;
    file.write_all(buf)?;
    file.flush()?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn read_at(r: &mut BufReader<File>, ptr: ValuePointer) -> Result<Vec<u8>> {
    r.seek(SeekFrom::Start(ptr.offset))?;
    let mut value = vec![0u8; ptr.size as usize];
    let mut read = 0;
    while read < value.len() {
        match r.read(&mut value[read..])? {
            0 => {
                return Err(Error::ReadUnexpectedBytes {
                    expected: value.len(),
                    actual: read,
                })
            }
            n => read += n,
        }
    }
    Ok(value)
}

/// Length of the longest prefix of the log made of complete records.
fn valid_prefix(path: &Path, len: u64) -> Result<u64> {
    let mut r = BufReader::new(File::open(path)?);
    let mut pos = 0u64;
    while pos + RECORD_OVERHEAD <= len {
        let key_len = u64::from(r.read_u16::<LittleEndian>()?);
        if pos + 2 + key_len + 4 > len {
            break;
        }
        r.seek_relative(key_len as i64)?;
        let value_len = u64::from(r.read_u32::<LittleEndian>()?);
        let end = pos + RECORD_OVERHEAD + key_len + value_len;
        if end > len {
            break;
        }
        r.seek_relative(value_len as i64)?;
        pos = end;
    }
    Ok(pos)
}

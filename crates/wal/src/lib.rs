//! # WAL - Write-Ahead Log
//!
//! Durability for one memtable generation. A commit's entries are appended
//! here before the memtable index sees them; replaying the file rebuilds
//! the index after a crash.
//!
//! ## Frame
//!
//! ```text
//! [len: u32 LE][crc32(body): u32 LE][body: len - 4 bytes]
//!
//! body = [0][entry]                    single entry
//!      | [1][count: u32 LE][entry]*    a commit's write set
//! ```
//!
//! Entries use the [`codec::Entry`] encoding. A transaction is always one
//! `Batch` frame, so a crash keeps all of its entries or none of them.
//!
//! ## Recovery rules
//!
//! | tail of the file                 | replay result                 |
//! |----------------------------------|-------------------------------|
//! | nothing                          | `Ok`                          |
//! | a frame cut short                | `Ok`, frame ignored           |
//! | complete frame, bad CRC          | `Err(Corrupt)`                |
//! | CRC-valid frame, bad body        | `Err(Corrupt)` / `Err(Codec)` |
//!
//! After a successful replay, [`WalReader::valid_len`] is the offset the
//! next append must start at.
//!
//! ```rust,no_run
//! use codec::{Entry, Value};
//! use wal::{WalReader, WalRecord, WalWriter};
//!
//! let mut w = WalWriter::create("WAL_1", true).unwrap();
//! w.append(&WalRecord::Put(Entry::new("hello", 1, Value::from("world")))).unwrap();
//! drop(w);
//!
//! let mut r = WalReader::open("WAL_1").unwrap();
//! r.replay(|rec| println!("{:?}", rec)).unwrap();
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use codec::{Decoder, Entry};
use thiserror::Error;
use tracing::warn;

const OP_PUT: u8 = 0;
const OP_BATCH: u8 = 1;

/// `len` + `crc`.
const FRAME_HEADER: usize = 8;

/// Largest `len` accepted on replay.
const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// What one frame carries.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Put(Entry),
    Batch(Vec<Entry>),
}

impl WalRecord {
    pub fn into_entries(self) -> Vec<Entry> {
        match self {
            WalRecord::Put(e) => vec![e],
            WalRecord::Batch(es) => es,
        }
    }

    /// Appends the frame for this record to `buf`.
    fn encode_frame(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        let start = buf.len();
        buf.extend_from_slice(&[0; FRAME_HEADER]);
        match self {
            WalRecord::Put(entry) => {
                buf.push(OP_PUT);
                entry.encode_into(buf);
            }
            WalRecord::Batch(entries) => {
                buf.push(OP_BATCH);
                buf.write_u32::<LittleEndian>(entries.len() as u32)?;
                for entry in entries {
                    entry.encode_into(buf);
                }
            }
        }

        let body = &buf[start + FRAME_HEADER..];
        let len = u32::try_from(body.len() + 4)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "WAL record exceeds 4 GiB"))?;
        let crc = crc32fast::hash(body);
        buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        buf[start + 4..start + 8].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self, WalError> {
        let mut d = Decoder::new(body);
        let record = match d.u8()? {
            OP_PUT => WalRecord::Put(Entry::decode(&mut d)?),
            OP_BATCH => {
                let count = d.u32()? as usize;
                // an entry is never shorter than one byte
                if count > d.remaining() {
                    return Err(WalError::Corrupt);
                }
                let entries = (0..count)
                    .map(|_| Entry::decode(&mut d))
                    .collect::<codec::Result<Vec<_>>>()?;
                WalRecord::Batch(entries)
            }
            _ => return Err(WalError::Corrupt),
        };
        if !d.is_empty() {
            return Err(WalError::Corrupt);
        }
        Ok(record)
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Bad CRC, frame length or op code.
    #[error("corrupt record")]
    Corrupt,

    /// The frame is intact but its entries do not decode.
    #[error("undecodable record: {0}")]
    Codec(#[from] codec::Error),
}

impl From<WalError> for codec::Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::Io(e) => codec::Error::Io(e),
            WalError::Corrupt => codec::Error::corrupt("wal record failed validation"),
            WalError::Codec(e) => e,
        }
    }
}

/// Appends frames to a WAL file.
///
/// Each append is one `write_all` of a complete frame, followed by an fsync
/// when `sync` is set. A failed append cuts the file back to its previous
/// length.
pub struct WalWriter {
    file: File,
    sync: bool,
    len: u64,
    scratch: Vec<u8>,
}

impl WalWriter {
    /// Opens `path` for appending, creating it if missing.
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sync,
            len,
            scratch: Vec::with_capacity(256),
        })
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), WalError> {
        self.scratch.clear();
        record.encode_frame(&mut self.scratch)?;

        let written = self.file.write_all(&self.scratch).and_then(|()| {
            if self.sync {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(cut) = self.file.set_len(self.len) {
                warn!(error = %cut, len = self.len, "failed to cut back partial WAL frame");
            }
            return Err(e.into());
        }
        self.len += self.scratch.len() as u64;
        Ok(())
    }

    pub fn sync_to_disk(&mut self) -> Result<(), WalError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Bytes of complete frames in the file.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Reads frames back in order. Works over any `Read`, so tests can replay
/// from memory.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
    valid_len: u64,
    body: Vec<u8>,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        Ok(Self::from_reader(File::open(path)?))
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
            valid_len: 0,
            body: Vec::with_capacity(256),
        }
    }

    /// Length of the prefix made of complete frames read so far. Once
    /// [`replay`](Self::replay) has returned `Ok`, anything past this offset
    /// is a torn tail.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Calls `apply` for every complete frame, in file order.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<(), WalError>
    where
        F: FnMut(WalRecord),
    {
        while let Some(record) = self.next_record()? {
            apply(record);
        }
        Ok(())
    }

    /// The next frame's record, or `None` at the end of the log or at a
    /// frame cut short.
    fn next_record(&mut self) -> Result<Option<WalRecord>, WalError> {
        let len = match eof_as_none(self.rdr.read_u32::<LittleEndian>())? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len <= 4 || len > MAX_FRAME_LEN {
            return Err(WalError::Corrupt);
        }
        let crc = match eof_as_none(self.rdr.read_u32::<LittleEndian>())? {
            Some(crc) => crc,
            None => return Ok(None),
        };

        self.body.resize((len - 4) as usize, 0);
        if eof_as_none(self.rdr.read_exact(&mut self.body))?.is_none() {
            return Ok(None);
        }
        if crc32fast::hash(&self.body) != crc {
            return Err(WalError::Corrupt);
        }

        let record = WalRecord::decode_body(&self.body)?;
        self.valid_len += 4 + u64::from(len);
        Ok(Some(record))
    }
}

fn eof_as_none<T>(res: io::Result<T>) -> Result<Option<T>, WalError> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(WalError::Io(e)),
    }
}

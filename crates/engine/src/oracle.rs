//! # Oracle
//!
//! The single serialisation point of the engine. One thread hands out
//! snapshot timestamps and validates and applies commits, one request at a
//! time, so conflict detection is linearizable.
//!
//! ## Conflict rule
//!
//! A transaction that read `key` at snapshot `s` aborts if `key` was
//! committed at some `ts > s`. Only the last `oracle_window` commits are
//! remembered; once an older commit is evicted, any read older than the
//! newest evicted commit aborts as well, since the evicted commit may have
//! touched it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use codec::{Entry, Error, Result, Value};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::storage::Storage;

/// Recently committed keys with their commit timestamps.
#[derive(Debug)]
pub(crate) struct CommitWindow {
    capacity: usize,
    latest: HashMap<String, u64>,
    /// Commit order; entries superseded in `latest` are skipped on eviction.
    order: VecDeque<(u64, String)>,
    max_evicted_ts: u64,
}

impl CommitWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            latest: HashMap::new(),
            order: VecDeque::new(),
            max_evicted_ts: 0,
        }
    }

    /// Returns the first key of `read_set` that a later commit invalidated.
    pub(crate) fn conflict<'a>(&self, read_set: &'a [(String, u64)]) -> Option<&'a str> {
        read_set.iter().find_map(|(key, observed)| {
            let newer = self.latest.get(key).map_or(false, |ts| ts > observed);
            (newer || self.max_evicted_ts > *observed).then_some(key.as_str())
        })
    }

    pub(crate) fn record<'a>(&mut self, ts: u64, keys: impl IntoIterator<Item = &'a str>) {
        for key in keys {
            self.latest.insert(key.to_string(), ts);
            self.order.push_back((ts, key.to_string()));
        }
        while self.order.len() > self.capacity {
            let Some((ts, key)) = self.order.pop_front() else {
                break;
            };
            if self.latest.get(&key) == Some(&ts) {
                self.latest.remove(&key);
                self.max_evicted_ts = self.max_evicted_ts.max(ts);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn max_evicted_ts(&self) -> u64 {
        self.max_evicted_ts
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.latest.len()
    }
}

enum OracleRequest {
    Start(Sender<u64>),
    Peek(Sender<u64>),
    Commit {
        read_set: Vec<(String, u64)>,
        writes: Vec<(String, Value)>,
        reply: Sender<Result<Option<u64>>>,
    },
    Shutdown,
}

struct OracleTask {
    storage: Arc<Storage>,
    next_ts: u64,
    window: CommitWindow,
}

impl OracleTask {
    fn run(mut self, rx: crossbeam_channel::Receiver<OracleRequest>) {
        for req in rx {
            match req {
                OracleRequest::Start(reply) => {
                    let ts = self.next_ts;
                    self.next_ts += 1;
                    let _ = reply.send(ts);
                }
                OracleRequest::Peek(reply) => {
                    let _ = reply.send(self.next_ts);
                }
                OracleRequest::Commit {
                    read_set,
                    writes,
                    reply,
                } => {
                    let res = self.commit(read_set, writes);
                    let _ = reply.send(res);
                }
                OracleRequest::Shutdown => break,
            }
        }
        debug!(next_ts = self.next_ts, "oracle stopped");
    }

    fn commit(&mut self, read_set: Vec<(String, u64)>, writes: Vec<(String, Value)>) -> Result<Option<u64>> {
        if writes.is_empty() {
            return Ok(None);
        }
        if let Some(key) = self.window.conflict(&read_set) {
            debug!(key, "commit aborted by a newer write");
            return Err(Error::TxnAbort);
        }

        let ts = self.next_ts;
        self.next_ts += 1;
        let entries: Vec<Entry> = writes
            .iter()
            .map(|(key, value)| match value {
                Value::Tombstone => Entry::tombstone(key.as_str(), ts),
                v => Entry::new(key.as_str(), ts, v.clone()),
            })
            .collect();
        self.storage.apply(entries)?;
        self.window.record(ts, writes.iter().map(|(k, _)| k.as_str()));
        trace!(ts, keys = writes.len(), "committed");
        Ok(Some(ts))
    }
}

/// Handle to the oracle thread.
pub struct Oracle {
    tx: Sender<OracleRequest>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Oracle {
    /// Starts the oracle with `next_ts` as the first timestamp it hands out.
    pub(crate) fn start(storage: Arc<Storage>, next_ts: u64, window: usize) -> Result<Self> {
        let (tx, rx) = unbounded();
        let task = OracleTask {
            storage,
            next_ts,
            window: CommitWindow::new(window),
        };
        let handle = thread::Builder::new()
            .name("oracle".into())
            .spawn(move || task.run(rx))?;
        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Issues a fresh snapshot timestamp.
    pub fn begin(&self) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(OracleRequest::Start(reply))
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    /// The timestamp the next `begin` or commit will receive.
    pub fn peek(&self) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(OracleRequest::Peek(reply))
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)
    }

    /// Validates `read_set` and applies `writes` at a fresh timestamp.
    /// Returns the commit timestamp, or `None` for an empty write set.
    pub fn commit(&self, read_set: Vec<(String, u64)>, writes: Vec<(String, Value)>) -> Result<Option<u64>> {
        let (reply, rx) = bounded(1);
        self.tx
            .send(OracleRequest::Commit {
                read_set,
                writes,
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.recv().map_err(|_| Error::Closed)?
    }

    /// Stops the oracle thread. Requests already queued are served first.
    pub fn shutdown(&self) {
        let handle = match self.handle.lock().take() {
            Some(h) => h,
            None => return,
        };
        let _ = self.tx.send(OracleRequest::Shutdown);
        if handle.join().is_err() {
            warn!("oracle thread panicked");
        }
    }
}

impl Drop for Oracle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Bounded pool of threads that own all SSTable file I/O.
//!
//! Callers never open an SSTable themselves. They submit a job and get a
//! [`Ticket`], a one-shot reply slot they block on. At most `workers` files
//! are open at any moment, however many queries are in flight.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use codec::{Entry, Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::reader::SstReader;
use crate::writer::{SstWriter, TableMeta};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pending reply of a submitted job.
#[must_use = "a ticket does nothing unless waited on"]
pub struct Ticket<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Blocks until the job has run. A pool that shut down before running
    /// the job yields [`Error::Closed`].
    pub fn wait(self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::Closed)?
    }
}

pub struct FilePool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FilePool {
    /// Starts `workers` threads sharing one bounded job queue.
    pub fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Job>(workers * 4);
        let handles = (0..workers)
            .map(|i| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("sst-worker-{}", i))
                    .spawn(move || {
                        for job in rx {
                            job();
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        debug!(workers, "started sstable file workers");
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Queues `f` and returns its reply slot. Blocks while the queue is full.
    pub fn submit<T, F>(&self, f: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            let job: Job = Box::new(move || {
                // the caller may have stopped waiting
                let _ = reply_tx.send(f());
            });
            if sender.send(job).is_err() {
                warn!("sstable file pool is gone; dropping job");
            }
        }
        Ticket { rx: reply_rx }
    }

    pub fn find(&self, path: PathBuf, key: String, snapshot: u64) -> Ticket<Option<Entry>> {
        self.submit(move || SstReader::open(&path)?.find(&key, snapshot))
    }

    pub fn range(&self, path: PathBuf, start: String, end: String, snapshot: u64) -> Ticket<Vec<Entry>> {
        self.submit(move || SstReader::open(&path)?.range(&start, &end, snapshot))
    }

    pub fn read_all(&self, path: PathBuf) -> Ticket<Vec<Entry>> {
        self.submit(move || SstReader::open(&path)?.read_all())
    }

    pub fn read_meta(&self, path: PathBuf) -> Ticket<TableMeta> {
        self.submit(move || SstReader::open(&path)?.meta())
    }

    pub fn write(&self, path: PathBuf, block_size: usize, entries: Vec<Entry>) -> Ticket<TableMeta> {
        self.submit(move || SstWriter::write(&path, block_size, &entries))
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            if h.join().is_err() {
                warn!("sstable file worker panicked");
            }
        }
    }
}

impl Drop for FilePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

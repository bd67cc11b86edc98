//! Debounced background writer.

use super::{encode_collection, BlobStore};
use crate::error::{DbError, Result};
use crate::types::Collection;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum WriterMessage {
    Save {
        key: String,
        collection: Collection,
        delay: Duration,
    },
    Flush(Sender<()>),
    Shutdown,
}

struct Pending {
    collection: Collection,
    due: Instant,
}

/// Writes collections to a blob store on a background thread.
///
/// Saves for the same key are coalesced: each new save replaces the pending
/// collection and restarts its delay, so only the last version of a burst is
/// written. Dropping the writer writes everything still pending.
pub(crate) struct CollectionWriter {
    sender: Sender<WriterMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CollectionWriter {
    pub fn spawn(store: Arc<dyn BlobStore>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let handle = thread::Builder::new()
            .name("localdb-writer".into())
            .spawn(move || run(store, receiver))?;
        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Schedule a write of `collection` under `key` after `delay` of quiet.
    pub fn schedule(&self, key: &str, collection: Collection, delay: Duration) -> Result<()> {
        self.sender
            .send(WriterMessage::Save {
                key: key.to_string(),
                collection,
                delay,
            })
            .map_err(|_| DbError::Persistence("writer thread is gone".into()))
    }

    /// Write everything pending now and wait for it.
    ///
    /// If the thread died, it is joined before the error is returned, so
    /// every later `schedule` fails too.
    pub fn flush(&self) -> Result<()> {
        let (ack, done) = crossbeam_channel::bounded(1);
        let sent = self.sender.send(WriterMessage::Flush(ack)).is_ok();
        if sent && done.recv().is_ok() {
            return Ok(());
        }
        self.reap();
        Err(DbError::Persistence("writer thread is gone".into()))
    }

    fn reap(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("blob writer thread panicked");
            }
        }
    }
}

impl Drop for CollectionWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(WriterMessage::Shutdown);
        self.reap();
    }
}

fn write(store: &dyn BlobStore, key: &str, collection: &Collection) {
    let result = encode_collection(collection).and_then(|bytes| store.save_blob(key, &bytes));
    match result {
        Ok(()) => debug!(key, docs = collection.len(), "collection written"),
        Err(e) => warn!(key, error = %e, "failed to write collection"),
    }
}

fn write_all(store: &dyn BlobStore, pending: &mut HashMap<String, Pending>) {
    for (key, entry) in pending.drain() {
        write(store, &key, &entry.collection);
    }
}

fn write_due(store: &dyn BlobStore, pending: &mut HashMap<String, Pending>) {
    let now = Instant::now();
    let due: Vec<String> = pending
        .iter()
        .filter(|(_, p)| p.due <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in due {
        if let Some(entry) = pending.remove(&key) {
            write(store, &key, &entry.collection);
        }
    }
}

fn run(store: Arc<dyn BlobStore>, receiver: Receiver<WriterMessage>) {
    let mut pending: HashMap<String, Pending> = HashMap::new();

    loop {
        let next_due = pending.values().map(|p| p.due).min();
        let message = match next_due {
            Some(deadline) => match receiver.recv_deadline(deadline) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(WriterMessage::Shutdown),
            },
            None => Some(receiver.recv().unwrap_or(WriterMessage::Shutdown)),
        };

        match message {
            Some(WriterMessage::Save {
                key,
                collection,
                delay,
            }) => {
                pending.insert(
                    key,
                    Pending {
                        collection,
                        due: Instant::now() + delay,
                    },
                );
            }
            Some(WriterMessage::Flush(ack)) => {
                write_all(store.as_ref(), &mut pending);
                let _ = ack.send(());
            }
            Some(WriterMessage::Shutdown) => {
                write_all(store.as_ref(), &mut pending);
                return;
            }
            None => write_due(store.as_ref(), &mut pending),
        }
    }
}

//! Transaction coordinator state.
//!
//! Holds the single open-transaction slot, its rollback log and accumulated
//! changes, the commit flag and the FIFO of operations deferred while
//! listeners run. The engine drives the state machine; this module only owns
//! the bookkeeping.

use crate::operations::{HistoryStep, Operation};
use crate::types::{ChangeSet, ChangedFields, Document, Patch, Snapshot, TxOptions};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Maximum number of deferred operations drained after one commit.
pub const MAX_QUEUED_OPERATIONS: usize = 100;

/// Key of an open transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxKey(Uuid);

impl TxKey {
    fn generate() -> Self {
        TxKey(Uuid::new_v4())
    }
}

impl fmt::Debug for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxKey({})", self.0)
    }
}

/// Inverse of one mutation's index maintenance.
#[derive(Clone, Debug)]
pub(crate) enum RollbackAction {
    IndexRepair {
        collection: String,
        remove: Vec<Document>,
        insert: Vec<Document>,
    },
}

/// State of the open transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub key: TxKey,
    /// Store version captured by `begin`.
    pub snapshot: Snapshot,
    pub options: TxOptions,
    pub changes: ChangeSet,
    pub changed_fields: ChangedFields,
    pub rollbacks: Vec<RollbackAction>,
    pub steps: Vec<HistoryStep>,
}

impl Transaction {
    /// Record a document change payload. `None` marks a deletion.
    pub fn record_change(&mut self, collection: &str, id: &str, change: Option<Patch>) {
        let docs = self.changes.entry(collection.to_string()).or_default();
        match change {
            Some(change) => match docs.get_mut(id) {
                Some(Some(existing)) => existing.merge(change),
                _ => {
                    docs.insert(id.to_string(), Some(change));
                }
            },
            None => {
                docs.insert(id.to_string(), None);
            }
        }
    }

    pub fn record_fields<'a>(&mut self, collection: &str, fields: impl IntoIterator<Item = &'a str>) {
        self.changed_fields
            .entry(collection.to_string())
            .or_default()
            .extend(fields.into_iter().map(str::to_string));
    }
}

/// Owner of the transaction slot and the replay queue.
#[derive(Debug, Default)]
pub(crate) struct TxCoordinator {
    current: Option<Transaction>,
    committing: bool,
    draining: bool,
    in_undo_redo: bool,
    queue: VecDeque<(Operation, Option<TxOptions>)>,
}

impl TxCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction. Returns `None` if one is already open.
    pub fn begin(&mut self, snapshot: Snapshot, options: TxOptions) -> Option<TxKey> {
        if self.current.is_some() {
            return None;
        }
        let key = TxKey::generate();
        self.current = Some(Transaction {
            key,
            snapshot,
            options,
            changes: ChangeSet::new(),
            changed_fields: ChangedFields::new(),
            rollbacks: Vec::new(),
            steps: Vec::new(),
        });
        Some(key)
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_current(&self, key: TxKey) -> bool {
        self.current.as_ref().is_some_and(|t| t.key == key)
    }

    pub fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut()
    }

    /// Close the slot, handing back its state.
    pub fn take(&mut self) -> Option<Transaction> {
        self.current.take()
    }

    // --- Commit phase ---

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    pub fn set_committing(&mut self, committing: bool) {
        self.committing = committing;
    }

    // --- Undo/redo replay ---

    pub fn in_undo_redo(&self) -> bool {
        self.in_undo_redo
    }

    pub fn set_in_undo_redo(&mut self, value: bool) {
        self.in_undo_redo = value;
    }

    /// Whether mutations of the open transaction produce history steps.
    pub fn records_history(&self) -> bool {
        !self.in_undo_redo && self.current.as_ref().is_some_and(|t| t.options.undoable)
    }

    // --- Replay queue ---

    pub fn enqueue(&mut self, operation: Operation, options: Option<TxOptions>) {
        self.queue.push_back((operation, options));
    }

    pub fn dequeue(&mut self) -> Option<(Operation, Option<TxOptions>)> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Claim the drain. Returns false if a drain is already running or there
    /// is nothing to drain.
    pub fn start_drain(&mut self) -> bool {
        if self.draining || self.queue.is_empty() {
            return false;
        }
        self.draining = true;
        true
    }

    pub fn stop_drain(&mut self) {
        self.draining = false;
    }
}

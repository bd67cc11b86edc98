//! History entries and the undo cursor.

use crate::operations::HistoryStep;

/// Steps recorded by one undoable transaction.
pub type HistoryEntry = Vec<HistoryStep>;

/// Linear history with a cursor.
///
/// Entries before the cursor can be undone, entries at and after it redone.
#[derive(Debug, Default)]
pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    index: usize,
}

impl HistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the cursor, discarding everything after it.
    ///
    /// Empty entries are ignored.
    pub fn push(&mut self, entry: HistoryEntry) {
        if entry.is_empty() {
            return;
        }
        self.entries.truncate(self.index);
        self.entries.push(entry);
        self.index = self.entries.len();
    }

    /// The entry an undo would revert.
    pub fn undo_entry(&self) -> Option<&HistoryEntry> {
        self.index.checked_sub(1).and_then(|i| self.entries.get(i))
    }

    /// The entry a redo would reapply.
    pub fn redo_entry(&self) -> Option<&HistoryEntry> {
        self.entries.get(self.index)
    }

    pub fn can_undo(&self) -> bool {
        self.undo_entry().is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.redo_entry().is_some()
    }

    pub(crate) fn step_back(&mut self) {
        self.index = self.index.saturating_sub(1);
    }

    pub(crate) fn step_forward(&mut self) {
        self.index = (self.index + 1).min(self.entries.len());
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index.min(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index = 0;
    }
}

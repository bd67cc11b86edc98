//! Undo/redo history.
//!
//! One entry per committed undoable transaction, each a list of
//! [`HistoryStep`](crate::operations::HistoryStep)s. Undo replays an entry's
//! `undo` operations newest-first; redo replays its `redo` operations in
//! order.

mod manager;

pub use manager::{HistoryEntry, HistoryManager};

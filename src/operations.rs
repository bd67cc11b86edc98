//! Mutation operations as data.
//!
//! The same vocabulary drives live calls deferred by the replay queue and
//! undo/redo replay, through one interpreter.

use crate::db::Db;
use crate::error::Result;
use crate::types::{Collection, Document, Patch, TxOptions};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub type DocUpdater = Rc<dyn Fn(&Document) -> Option<Patch>>;
pub type CollectionUpdater = Rc<dyn Fn(&Collection) -> Option<BTreeMap<String, Patch>>>;

/// Update of a single document: a patch, or a function of the stored
/// document returning one. `None` from the function is a no-op.
#[derive(Clone)]
pub enum DocUpdate {
    Patch(Patch),
    With(DocUpdater),
}

impl DocUpdate {
    pub fn with(f: impl Fn(&Document) -> Option<Patch> + 'static) -> Self {
        DocUpdate::With(Rc::new(f))
    }

    pub(crate) fn resolve(&self, prev: &Document) -> Option<Patch> {
        match self {
            DocUpdate::Patch(patch) => Some(patch.clone()),
            DocUpdate::With(f) => f(prev),
        }
    }
}

impl From<Patch> for DocUpdate {
    fn from(patch: Patch) -> Self {
        DocUpdate::Patch(patch)
    }
}

impl fmt::Debug for DocUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocUpdate::Patch(patch) => f.debug_tuple("Patch").field(patch).finish(),
            DocUpdate::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Update of many documents of one collection: id-keyed patches, or a
/// function of the whole collection returning them.
#[derive(Clone)]
pub enum CollectionUpdate {
    Patches(BTreeMap<String, Patch>),
    With(CollectionUpdater),
}

impl CollectionUpdate {
    pub fn with(f: impl Fn(&Collection) -> Option<BTreeMap<String, Patch>> + 'static) -> Self {
        CollectionUpdate::With(Rc::new(f))
    }

    pub(crate) fn resolve(&self, prev: &Collection) -> Option<BTreeMap<String, Patch>> {
        match self {
            CollectionUpdate::Patches(patches) => Some(patches.clone()),
            CollectionUpdate::With(f) => f(prev),
        }
    }
}

impl From<BTreeMap<String, Patch>> for CollectionUpdate {
    fn from(patches: BTreeMap<String, Patch>) -> Self {
        CollectionUpdate::Patches(patches)
    }
}

impl fmt::Debug for CollectionUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionUpdate::Patches(patches) => f.debug_tuple("Patches").field(patches).finish(),
            CollectionUpdate::With(_) => f.write_str("With(..)"),
        }
    }
}

/// A mutation call and its arguments.
#[derive(Clone, Debug)]
pub enum Operation {
    SetDoc {
        collection: String,
        doc: Document,
    },
    SetDocs {
        collection: String,
        docs: Vec<Document>,
    },
    UpdateDoc {
        collection: String,
        id: String,
        update: DocUpdate,
    },
    UpdateDocs {
        collection: String,
        update: CollectionUpdate,
    },
    DeleteDoc {
        collection: String,
        id: String,
    },
    DeleteDocs {
        collection: String,
        ids: Vec<String>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SetDoc { .. } => "set_doc",
            Operation::SetDocs { .. } => "set_docs",
            Operation::UpdateDoc { .. } => "update_doc",
            Operation::UpdateDocs { .. } => "update_docs",
            Operation::DeleteDoc { .. } => "delete_doc",
            Operation::DeleteDocs { .. } => "delete_docs",
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Operation::SetDoc { collection, .. }
            | Operation::SetDocs { collection, .. }
            | Operation::UpdateDoc { collection, .. }
            | Operation::UpdateDocs { collection, .. }
            | Operation::DeleteDoc { collection, .. }
            | Operation::DeleteDocs { collection, .. } => collection,
        }
    }
}

/// One undoable mutation: the operation reverting it and the one reapplying it.
#[derive(Clone, Debug)]
pub struct HistoryStep {
    pub undo: Operation,
    pub redo: Operation,
}

/// Apply an operation through the public mutation API.
pub fn apply_operation(db: &Db, operation: Operation, options: Option<TxOptions>) -> Result<()> {
    match operation {
        Operation::SetDoc { collection, doc } => db.set_doc(&collection, doc, options),
        Operation::SetDocs { collection, docs } => db.set_docs(&collection, docs, options),
        Operation::UpdateDoc {
            collection,
            id,
            update,
        } => db.update_doc(&collection, &id, update, options),
        Operation::UpdateDocs { collection, update } => {
            db.update_docs(&collection, update, options)
        }
        Operation::DeleteDoc { collection, id } => db.delete_doc(&collection, &id, options),
        Operation::DeleteDocs { collection, ids } => db.delete_docs(&collection, ids, options),
    }
}

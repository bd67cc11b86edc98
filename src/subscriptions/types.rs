//! Listener ids and change events.

use crate::db::Db;
use crate::types::{
    ChangeSet, ChangedFields, Collection, DocChanges, Document, Patch, Snapshot, TxContext,
};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

/// Handle of a registered listener.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

impl fmt::Debug for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ListenerId({})", self.0)
    }
}

/// A committed change of one field of one document.
#[derive(Debug)]
pub struct FieldEvent<'a> {
    pub collection: &'a str,
    pub id: &'a str,
    pub field: &'a str,
    pub next: Option<&'a Value>,
    pub prev: Option<&'a Value>,
    pub next_doc: Option<&'a Document>,
    pub prev_doc: Option<&'a Document>,
    pub context: &'a TxContext,
}

/// A committed change of one document.
#[derive(Debug)]
pub struct DocEvent<'a> {
    pub collection: &'a str,
    pub id: &'a str,
    pub next: Option<&'a Document>,
    pub prev: Option<&'a Document>,
    /// Fields written by the transaction; `None` when the document was deleted.
    pub change: Option<&'a Patch>,
    pub context: &'a TxContext,
}

/// A committed change of one collection.
#[derive(Debug)]
pub struct CollectionEvent<'a> {
    pub collection: &'a str,
    pub next: Option<&'a Collection>,
    pub prev: Option<&'a Collection>,
    pub changes: Option<&'a DocChanges>,
    pub changed_fields: Option<&'a BTreeSet<String>>,
    pub context: &'a TxContext,
}

/// A committed transaction.
#[derive(Debug)]
pub struct DbEvent<'a> {
    pub next: &'a Snapshot,
    pub prev: &'a Snapshot,
    pub changes: &'a ChangeSet,
    pub changed_fields: &'a ChangedFields,
    pub context: &'a TxContext,
}

pub type DbListener = Rc<dyn Fn(&Db, &DbEvent<'_>)>;
pub type CollectionListener = Rc<dyn Fn(&Db, &CollectionEvent<'_>)>;
pub type DocListener = Rc<dyn Fn(&Db, &DocEvent<'_>)>;
pub type FieldListener = Rc<dyn Fn(&Db, &FieldEvent<'_>)>;

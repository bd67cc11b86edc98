//! Listener registry and the commit notification pass.

use crate::db::Db;
use crate::types::{ChangeSet, ChangedFields, Document, Snapshot, TxContext};
use std::cell::{Cell, RefCell};

use super::types::{
    CollectionEvent, CollectionListener, DbEvent, DbListener, DocEvent, DocListener, FieldEvent,
    FieldListener, ListenerId,
};

#[derive(Clone)]
struct DbEntry {
    id: ListenerId,
    handler: DbListener,
}

#[derive(Clone)]
struct CollectionEntry {
    id: ListenerId,
    collection: String,
    handler: CollectionListener,
}

#[derive(Clone)]
struct DocEntry {
    id: ListenerId,
    collection: String,
    doc_id: String,
    handler: DocListener,
}

#[derive(Clone)]
struct FieldEntry {
    id: ListenerId,
    collection: String,
    doc_id: String,
    field: String,
    handler: FieldListener,
}

/// Everything a notification pass needs from one commit.
pub(crate) struct Commit<'a> {
    pub prev: &'a Snapshot,
    pub next: &'a Snapshot,
    pub changes: &'a ChangeSet,
    pub changed_fields: &'a ChangedFields,
    pub context: &'a TxContext,
}

impl Commit<'_> {
    fn docs(&self, collection: &str, id: &str) -> (Option<&Document>, Option<&Document>) {
        let next = self.next.get(collection).and_then(|c| c.get(id));
        let prev = self.prev.get(collection).and_then(|c| c.get(id));
        (next, prev)
    }
}

fn same_ref<T>(a: Option<&T>, b: Option<&T>, ptr_eq: impl Fn(&T, &T) -> bool) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Registered listeners at four granularities.
///
/// Listeners keep registration order. Delivery iterates a copy of each list,
/// so handlers may subscribe or unsubscribe while a pass runs.
pub(crate) struct ListenerRegistry {
    next_id: Cell<u64>,
    db: RefCell<Vec<DbEntry>>,
    collections: RefCell<Vec<CollectionEntry>>,
    docs: RefCell<Vec<DocEntry>>,
    fields: RefCell<Vec<FieldEntry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            db: RefCell::new(Vec::new()),
            collections: RefCell::new(Vec::new()),
            docs: RefCell::new(Vec::new()),
            fields: RefCell::new(Vec::new()),
        }
    }

    fn allocate(&self) -> ListenerId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        ListenerId(id)
    }

    pub fn add_db(&self, handler: DbListener) -> ListenerId {
        let id = self.allocate();
        self.db.borrow_mut().push(DbEntry { id, handler });
        id
    }

    pub fn add_collection(&self, collection: &str, handler: CollectionListener) -> ListenerId {
        let id = self.allocate();
        self.collections.borrow_mut().push(CollectionEntry {
            id,
            collection: collection.to_string(),
            handler,
        });
        id
    }

    pub fn add_doc(&self, collection: &str, doc_id: &str, handler: DocListener) -> ListenerId {
        let id = self.allocate();
        self.docs.borrow_mut().push(DocEntry {
            id,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            handler,
        });
        id
    }

    pub fn add_field(
        &self,
        collection: &str,
        doc_id: &str,
        field: &str,
        handler: FieldListener,
    ) -> ListenerId {
        let id = self.allocate();
        self.fields.borrow_mut().push(FieldEntry {
            id,
            collection: collection.to_string(),
            doc_id: doc_id.to_string(),
            field: field.to_string(),
            handler,
        });
        id
    }

    /// Remove a listener of any granularity. Returns false if unknown.
    pub fn remove(&self, id: ListenerId) -> bool {
        fn retain<T>(list: &RefCell<Vec<T>>, id: ListenerId, get: impl Fn(&T) -> ListenerId) -> bool {
            let mut list = list.borrow_mut();
            let before = list.len();
            list.retain(|e| get(e) != id);
            list.len() != before
        }

        retain(&self.db, id, |e| e.id)
            || retain(&self.collections, id, |e| e.id)
            || retain(&self.docs, id, |e| e.id)
            || retain(&self.fields, id, |e| e.id)
    }

    pub fn len(&self) -> usize {
        self.db.borrow().len()
            + self.collections.borrow().len()
            + self.docs.borrow().len()
            + self.fields.borrow().len()
    }

    // --- Delivery ---

    /// Deliver one commit: fields, then documents, then collections, then
    /// the whole database.
    pub fn notify(&self, db: &Db, commit: &Commit<'_>) {
        let fields = self.fields.borrow().clone();
        for entry in &fields {
            let (next_doc, prev_doc) = commit.docs(&entry.collection, &entry.doc_id);
            let next = next_doc.and_then(|d| d.get(&entry.field));
            let prev = prev_doc.and_then(|d| d.get(&entry.field));
            if next != prev {
                (entry.handler)(
                    db,
                    &FieldEvent {
                        collection: &entry.collection,
                        id: &entry.doc_id,
                        field: &entry.field,
                        next,
                        prev,
                        next_doc,
                        prev_doc,
                        context: commit.context,
                    },
                );
            }
        }

        let docs = self.docs.borrow().clone();
        for entry in &docs {
            let (next, prev) = commit.docs(&entry.collection, &entry.doc_id);
            if !same_ref(next, prev, Document::ptr_eq) {
                let change = commit
                    .changes
                    .get(&entry.collection)
                    .and_then(|c| c.get(&entry.doc_id))
                    .and_then(Option::as_ref);
                (entry.handler)(
                    db,
                    &DocEvent {
                        collection: &entry.collection,
                        id: &entry.doc_id,
                        next,
                        prev,
                        change,
                        context: commit.context,
                    },
                );
            }
        }

        let collections = self.collections.borrow().clone();
        for entry in &collections {
            let next = commit.next.get(&entry.collection);
            let prev = commit.prev.get(&entry.collection);
            if !same_ref(next, prev, |a, b| a.ptr_eq(b)) {
                (entry.handler)(
                    db,
                    &CollectionEvent {
                        collection: &entry.collection,
                        next,
                        prev,
                        changes: commit.changes.get(&entry.collection),
                        changed_fields: commit.changed_fields.get(&entry.collection),
                        context: commit.context,
                    },
                );
            }
        }

        let listeners = self.db.borrow().clone();
        for entry in &listeners {
            (entry.handler)(
                db,
                &DbEvent {
                    next: commit.next,
                    prev: commit.prev,
                    changes: commit.changes,
                    changed_fields: commit.changed_fields,
                    context: commit.context,
                },
            );
        }
    }
}

//! The database engine.
//!
//! [`Db`] owns the current [`Snapshot`], the per-collection indexes, the
//! transaction slot, the listener registry and the undo history. All methods
//! take `&self`; state lives in `RefCell`s and no borrow is held while user
//! code (compute rules, foreign computes, listeners, updaters) runs.
//!
//! Every mutation runs inside a transaction. If none is open, the mutation
//! opens one and commits it before returning; otherwise it joins the open one.
//! Mutations issued while listeners run are deferred to the replay queue and
//! executed after the notification pass.

use crate::blobs::{decode_collection, encode_collection, BlobStore, CollectionWriter};
use crate::compute;
use crate::error::{DbError, Result};
use crate::history::HistoryManager;
use crate::index::{CollectionIndexes, SortedIndex};
use crate::operations::{
    apply_operation, CollectionUpdate, DocUpdate, HistoryStep, Operation,
};
use crate::query::Query;
use crate::schema::{CollectionConfig, CollectionSchema};
use crate::subscriptions::{
    CollectionEvent, Commit, DbEvent, DocEvent, FieldEvent, ListenerId, ListenerRegistry,
};
use crate::transaction::{RollbackAction, TxCoordinator, TxKey, MAX_QUEUED_OPERATIONS};
use crate::types::{Collection, DocChange, Document, Patch, Snapshot, TxOptions};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Database configuration.
#[derive(Clone, Default)]
pub struct DbConfig {
    /// Options of transactions opened without explicit options.
    pub default_options: TxOptions,

    /// Persistence target for collections with a storage key.
    pub blob_store: Option<Arc<dyn BlobStore>>,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("default_options", &self.default_options)
            .field("blob_store", &self.blob_store.is_some())
            .finish()
    }
}

/// Effects of one mutation on one collection.
#[derive(Default)]
struct Staged {
    collection: Collection,
    changes: Vec<(String, Option<Patch>)>,
    fields: BTreeSet<String>,
    removed: Vec<Document>,
    inserted: Vec<Document>,
    step: Option<HistoryStep>,
    pairs: Vec<DocChange>,
}

struct CommitGuard<'a>(&'a RefCell<TxCoordinator>);

impl<'a> CommitGuard<'a> {
    fn enter(tx: &'a RefCell<TxCoordinator>) -> Self {
        tx.borrow_mut().set_committing(true);
        CommitGuard(tx)
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().set_committing(false);
    }
}

struct DrainGuard<'a>(&'a RefCell<TxCoordinator>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().stop_drain();
    }
}

/// An embedded transactional document store.
pub struct Db {
    default_options: TxOptions,
    /// Collection names in definition order.
    names: RefCell<Vec<String>>,
    schemas: RefCell<HashMap<String, Rc<CollectionSchema>>>,
    store: RefCell<Snapshot>,
    indexes: RefCell<HashMap<String, CollectionIndexes>>,
    tx: RefCell<TxCoordinator>,
    history: RefCell<HistoryManager>,
    listeners: ListenerRegistry,
    blob_store: Option<Arc<dyn BlobStore>>,
    writer: Option<CollectionWriter>,
}

impl Db {
    /// Create an empty database.
    pub fn new(config: DbConfig) -> Result<Self> {
        let writer = match &config.blob_store {
            Some(store) => Some(CollectionWriter::spawn(store.clone())?),
            None => None,
        };

        Ok(Self {
            default_options: config.default_options,
            names: RefCell::new(Vec::new()),
            schemas: RefCell::new(HashMap::new()),
            store: RefCell::new(Snapshot::default()),
            indexes: RefCell::new(HashMap::new()),
            tx: RefCell::new(TxCoordinator::new()),
            history: RefCell::new(HistoryManager::new()),
            listeners: ListenerRegistry::new(),
            blob_store: config.blob_store,
            writer,
        })
    }

    // --- Collections ---

    /// Define a collection.
    ///
    /// Without `initial` documents, a collection with a storage key is loaded
    /// from the blob store.
    pub fn define_collection(
        &self,
        name: &str,
        config: CollectionConfig,
        initial: Option<Vec<Document>>,
    ) -> Result<()> {
        if self.tx.borrow().is_open() {
            return Err(DbError::TransactionInProgress);
        }
        if self.exists_collection(name) {
            return Err(DbError::CollectionExists(name.to_string()));
        }

        let schema = Rc::new(CollectionSchema::compile(name, config)?);
        let collection = match initial {
            Some(docs) => Collection::from_docs(
                docs.iter().map(|d| schema.admit(d)).collect::<Result<Vec<_>>>()?,
            )?,
            None => match self.read_collection_blob(&schema)? {
                Some(loaded) => Collection::from_docs(
                    loaded.docs().map(|d| schema.admit(d)).collect::<Result<Vec<_>>>()?,
                )?,
                None => Collection::new(),
            },
        };
        let indexes = CollectionIndexes::build(&schema, &collection);

        debug!(collection = name, docs = collection.len(), "collection defined");

        {
            let mut store = self.store.borrow_mut();
            let next = store.with_collection(name, collection);
            *store = next;
        }
        self.indexes.borrow_mut().insert(name.to_string(), indexes);
        self.schemas.borrow_mut().insert(name.to_string(), schema);
        self.names.borrow_mut().push(name.to_string());
        Ok(())
    }

    /// Remove a collection, its documents and its indexes.
    pub fn delete_collection(&self, name: &str) -> Result<()> {
        if self.tx.borrow().is_open() {
            return Err(DbError::TransactionInProgress);
        }
        if self.schemas.borrow_mut().remove(name).is_none() {
            return Err(DbError::CollectionNotFound(name.to_string()));
        }

        self.names.borrow_mut().retain(|n| n != name);
        self.indexes.borrow_mut().remove(name);
        {
            let mut store = self.store.borrow_mut();
            let next = store.without_collection(name);
            *store = next;
        }

        debug!(collection = name, "collection deleted");
        Ok(())
    }

    pub fn exists_collection(&self, name: &str) -> bool {
        self.schemas.borrow().contains_key(name)
    }

    /// Defined collection names, in definition order.
    pub fn collection_names(&self) -> Vec<String> {
        self.names.borrow().clone()
    }

    fn schema(&self, name: &str) -> Result<Rc<CollectionSchema>> {
        self.schemas
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    fn contents(&self, name: &str) -> Result<Collection> {
        self.store
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    // --- Reads ---

    /// The current version of the whole database.
    pub fn snapshot(&self) -> Snapshot {
        self.store.borrow().clone()
    }

    /// Deep comparison with another snapshot.
    pub fn equals(&self, other: &Snapshot) -> bool {
        *self.store.borrow() == *other
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.store.borrow().to_value()
    }

    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.contents(name)
    }

    pub fn doc(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.contents(collection)?.get(id).cloned())
    }

    /// Documents by id, in request order; missing ids yield `None`.
    pub fn docs<S: AsRef<str>>(&self, collection: &str, ids: &[S]) -> Result<Vec<Option<Document>>> {
        let col = self.contents(collection)?;
        Ok(ids.iter().map(|id| col.get(id.as_ref()).cloned()).collect())
    }

    fn with_index<T>(
        &self,
        collection: &str,
        field: &str,
        f: impl FnOnce(&SortedIndex) -> T,
    ) -> Result<T> {
        let indexes = self.indexes.borrow();
        let set = indexes
            .get(collection)
            .ok_or_else(|| DbError::CollectionNotFound(collection.to_string()))?;
        let index = set.get(field).ok_or_else(|| DbError::IndexNotFound {
            collection: collection.to_string(),
            field: field.to_string(),
        })?;
        Ok(f(index))
    }

    /// All documents of a collection in the order of the index on `field`.
    pub fn docs_order_by(&self, collection: &str, field: &str) -> Result<Vec<Document>> {
        self.with_index(collection, field, SortedIndex::to_vec)
    }

    /// Documents within the bounds of a query, in index order.
    pub fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.with_index(&query.collection, &query.order_by, |index| {
            let (start, end) = query.bounds();
            let docs = index.range(start, end);
            let limit = query.limit.map_or(docs.len(), |l| l.min(docs.len()));
            docs[..limit].to_vec()
        })
    }

    /// Number of documents a query would return.
    pub fn count(&self, query: &Query) -> Result<usize> {
        self.with_index(&query.collection, &query.order_by, |index| {
            let (start, end) = query.bounds();
            let count = index.count_range(start, end);
            query.limit.map_or(count, |l| l.min(count))
        })
    }

    // --- Mutations ---

    fn is_committing(&self) -> bool {
        self.tx.borrow().is_committing()
    }

    fn defer(&self, operation: Operation, options: Option<TxOptions>) {
        let name = operation.name();
        let mut tx = self.tx.borrow_mut();
        tx.enqueue(operation, options);
        trace!(operation = name, queued = tx.queue_len(), "deferring operation until commit ends");
    }

    /// Whether a flag is set on the call options or the open transaction.
    fn tolerates(&self, options: Option<&TxOptions>, flag: fn(&TxOptions) -> bool) -> bool {
        options.is_some_and(flag) || self.tx.borrow().current().is_some_and(|t| flag(&t.options))
    }

    fn run_in_tx(&self, options: Option<TxOptions>, f: impl FnOnce() -> Result<()>) -> Result<()> {
        let key = self.begin_tx(options);
        match f() {
            Ok(()) => self.end_tx(key),
            Err(e) => {
                self.discard_tx();
                Err(e)
            }
        }
    }

    /// Publish a staged mutation: swap the collection, patch indexes, record
    /// bookkeeping on the open transaction, then run foreign computes.
    fn apply_staged(&self, schema: &CollectionSchema, staged: Staged) -> Result<()> {
        let name = schema.name();

        {
            let mut store = self.store.borrow_mut();
            let next = store.with_collection(name, staged.collection);
            *store = next;
        }

        if let Some(indexes) = self.indexes.borrow_mut().get_mut(name) {
            indexes.apply(&staged.removed, &staged.inserted);
        }

        {
            let mut tx = self.tx.borrow_mut();
            let records_history = tx.records_history();
            if let Some(t) = tx.current_mut() {
                for (id, change) in staged.changes {
                    t.record_change(name, &id, change);
                }
                t.record_fields(name, staged.fields.iter().map(String::as_str));
                t.rollbacks.push(RollbackAction::IndexRepair {
                    collection: name.to_string(),
                    remove: staged.inserted,
                    insert: staged.removed,
                });
                if records_history {
                    t.steps.extend(staged.step);
                }
            }
        }

        for rule in schema.foreign_computes() {
            (rule.compute)(self, &staged.pairs)?;
        }
        Ok(())
    }

    /// Insert or overwrite a document.
    ///
    /// Overwriting an existing id is an [`update_doc`](Self::update_doc)
    /// setting every declared field, removing the ones `doc` lacks. A new
    /// document is stored as given, limited to declared fields.
    pub fn set_doc(&self, collection: &str, doc: Document, options: Option<TxOptions>) -> Result<()> {
        if self.is_committing() {
            self.defer(
                Operation::SetDoc {
                    collection: collection.to_string(),
                    doc,
                },
                options,
            );
            return Ok(());
        }

        let schema = self.schema(collection)?;
        let id = doc.require_id()?.to_string();
        if self.contents(collection)?.contains(&id) {
            return self.update_doc(collection, &id, schema.overwrite_patch(&doc), options);
        }

        self.run_in_tx(options, || {
            let prev_col = self.contents(collection)?;
            let next = schema.admit(&doc)?;
            let staged = Staged {
                collection: prev_col.with_doc(&id, next.clone()),
                changes: vec![(id.clone(), Some(Patch::from_fields(next.fields())))],
                fields: next.fields().keys().cloned().collect(),
                removed: Vec::new(),
                inserted: vec![next.clone()],
                step: Some(HistoryStep {
                    undo: Operation::DeleteDoc {
                        collection: collection.to_string(),
                        id: id.clone(),
                    },
                    redo: Operation::SetDoc {
                        collection: collection.to_string(),
                        doc,
                    },
                }),
                pairs: vec![DocChange {
                    next: Some(next),
                    prev: None,
                }],
            };
            self.apply_staged(&schema, staged)
        })
    }

    /// Set several documents in one transaction.
    pub fn set_docs(
        &self,
        collection: &str,
        docs: Vec<Document>,
        options: Option<TxOptions>,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        if self.is_committing() {
            self.defer(
                Operation::SetDocs {
                    collection: collection.to_string(),
                    docs,
                },
                options,
            );
            return Ok(());
        }

        self.run_in_tx(options.clone(), || {
            for doc in docs {
                self.set_doc(collection, doc, options.clone())?;
            }
            Ok(())
        })
    }

    /// Update one document with a patch or an updater function.
    ///
    /// A patch that changes nothing, after normalization and computes, is a
    /// successful no-op.
    pub fn update_doc(
        &self,
        collection: &str,
        id: &str,
        update: impl Into<DocUpdate>,
        options: Option<TxOptions>,
    ) -> Result<()> {
        let update = update.into();
        if self.is_committing() {
            self.defer(
                Operation::UpdateDoc {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    update,
                },
                options,
            );
            return Ok(());
        }

        let schema = self.schema(collection)?;
        self.run_in_tx(options.clone(), || {
            let prev_col = self.contents(collection)?;
            let Some(prev) = prev_col.get(id).cloned() else {
                if self.tolerates(options.as_ref(), |o| o.ignore_not_found) {
                    return Ok(());
                }
                return Err(DbError::not_found(collection, id));
            };

            let Some(patch) = update.resolve(&prev).filter(|p| !p.is_empty()) else {
                return Ok(());
            };
            let Some(resolved) = compute::resolve(&schema, &prev, &patch)? else {
                return Ok(());
            };

            let (undo, redo) = resolved.patches(&prev);
            let next = resolved.next;
            let staged = Staged {
                collection: prev_col.with_doc(id, next.clone()),
                changes: vec![(id.to_string(), Some(redo.clone()))],
                fields: resolved.changed.into_iter().collect(),
                removed: vec![prev.clone()],
                inserted: vec![next.clone()],
                step: Some(HistoryStep {
                    undo: Operation::UpdateDoc {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        update: DocUpdate::Patch(undo),
                    },
                    redo: Operation::UpdateDoc {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        update: DocUpdate::Patch(redo),
                    },
                }),
                pairs: vec![DocChange {
                    next: Some(next),
                    prev: Some(prev),
                }],
            };
            self.apply_staged(&schema, staged)
        })
    }

    /// Update several documents of one collection.
    ///
    /// The collection is replaced, and listeners notified, only if at least
    /// one document actually changed.
    pub fn update_docs(
        &self,
        collection: &str,
        update: impl Into<CollectionUpdate>,
        options: Option<TxOptions>,
    ) -> Result<()> {
        let update = update.into();
        if self.is_committing() {
            self.defer(
                Operation::UpdateDocs {
                    collection: collection.to_string(),
                    update,
                },
                options,
            );
            return Ok(());
        }

        let schema = self.schema(collection)?;
        self.run_in_tx(options.clone(), || {
            let prev_col = self.contents(collection)?;
            let Some(patches) = update.resolve(&prev_col).filter(|p| !p.is_empty()) else {
                return Ok(());
            };
            let tolerant = self.tolerates(options.as_ref(), |o| o.ignore_not_found);

            let mut next_map = prev_col.to_map();
            let mut staged = Staged::default();
            let mut undo = BTreeMap::new();
            let mut redo = BTreeMap::new();

            for (id, patch) in &patches {
                let Some(prev) = prev_col.get(id) else {
                    if tolerant {
                        continue;
                    }
                    return Err(DbError::not_found(collection, id));
                };
                if patch.is_empty() {
                    continue;
                }
                let Some(resolved) = compute::resolve(&schema, prev, patch)? else {
                    continue;
                };

                let (undo_patch, redo_patch) = resolved.patches(prev);
                let next = resolved.next;
                next_map.insert(id.clone(), next.clone());
                staged.changes.push((id.clone(), Some(redo_patch.clone())));
                staged.fields.extend(resolved.changed);
                staged.removed.push(prev.clone());
                staged.inserted.push(next.clone());
                staged.pairs.push(DocChange {
                    next: Some(next),
                    prev: Some(prev.clone()),
                });
                undo.insert(id.clone(), undo_patch);
                redo.insert(id.clone(), redo_patch);
            }

            if staged.pairs.is_empty() {
                return Ok(());
            }

            staged.collection = Collection::from_map(next_map);
            staged.step = Some(HistoryStep {
                undo: Operation::UpdateDocs {
                    collection: collection.to_string(),
                    update: CollectionUpdate::Patches(undo),
                },
                redo: Operation::UpdateDocs {
                    collection: collection.to_string(),
                    update: CollectionUpdate::Patches(redo),
                },
            });
            self.apply_staged(&schema, staged)
        })
    }

    /// Delete one document.
    pub fn delete_doc(&self, collection: &str, id: &str, options: Option<TxOptions>) -> Result<()> {
        if self.is_committing() {
            self.defer(
                Operation::DeleteDoc {
                    collection: collection.to_string(),
                    id: id.to_string(),
                },
                options,
            );
            return Ok(());
        }

        let schema = self.schema(collection)?;
        self.run_in_tx(options.clone(), || {
            let prev_col = self.contents(collection)?;
            let Some(prev) = prev_col.get(id).cloned() else {
                if self.tolerates(options.as_ref(), |o| o.idempotent) {
                    return Ok(());
                }
                return Err(DbError::not_found(collection, id));
            };

            let mut next_map = prev_col.to_map();
            next_map.remove(id);

            let staged = Staged {
                collection: Collection::from_map(next_map),
                changes: vec![(id.to_string(), None)],
                fields: prev
                    .fields()
                    .keys()
                    .filter(|f| schema.is_declared(f))
                    .cloned()
                    .collect(),
                removed: vec![prev.clone()],
                inserted: Vec::new(),
                step: Some(HistoryStep {
                    undo: Operation::SetDoc {
                        collection: collection.to_string(),
                        doc: prev.clone(),
                    },
                    redo: Operation::DeleteDoc {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    },
                }),
                pairs: vec![DocChange {
                    next: None,
                    prev: Some(prev),
                }],
            };
            self.apply_staged(&schema, staged)
        })
    }

    /// Delete several documents in one transaction.
    pub fn delete_docs(
        &self,
        collection: &str,
        ids: Vec<String>,
        options: Option<TxOptions>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if self.is_committing() {
            self.defer(
                Operation::DeleteDocs {
                    collection: collection.to_string(),
                    ids,
                },
                options,
            );
            return Ok(());
        }

        let schema = self.schema(collection)?;
        self.run_in_tx(options.clone(), || {
            let prev_col = self.contents(collection)?;
            let tolerant = self.tolerates(options.as_ref(), |o| o.idempotent);

            let mut next_map = prev_col.to_map();
            let mut staged = Staged::default();
            let mut deleted = Vec::new();

            for id in &ids {
                let Some(prev) = prev_col.get(id) else {
                    if tolerant {
                        continue;
                    }
                    return Err(DbError::not_found(collection, id));
                };
                // Listed twice
                if next_map.remove(id).is_none() {
                    continue;
                }

                staged.changes.push((id.clone(), None));
                staged.fields.extend(
                    prev.fields()
                        .keys()
                        .filter(|f| schema.is_declared(f))
                        .cloned(),
                );
                staged.removed.push(prev.clone());
                staged.pairs.push(DocChange {
                    next: None,
                    prev: Some(prev.clone()),
                });
                deleted.push(id.clone());
            }

            if deleted.is_empty() {
                return Ok(());
            }

            staged.collection = Collection::from_map(next_map);
            staged.step = Some(HistoryStep {
                undo: Operation::SetDocs {
                    collection: collection.to_string(),
                    docs: staged.removed.clone(),
                },
                redo: Operation::DeleteDocs {
                    collection: collection.to_string(),
                    ids: deleted,
                },
            });
            self.apply_staged(&schema, staged)
        })
    }

    // --- Transactions ---

    /// Open a transaction. Returns `None` if one is already open, in which
    /// case the caller's work joins it.
    pub fn begin_tx(&self, options: Option<TxOptions>) -> Option<TxKey> {
        let options = options.unwrap_or_else(|| self.default_options.clone());
        let snapshot = self.store.borrow().clone();
        let key = self.tx.borrow_mut().begin(snapshot, options);
        if let Some(key) = key {
            trace!(?key, "transaction opened");
        }
        key
    }

    /// Commit the transaction opened with `key`.
    ///
    /// Does nothing unless `key` is the open transaction. A failed commit rolls
    /// back before returning the error. After the commit the replay queue is
    /// drained; an error from a deferred operation is returned here even
    /// though this transaction stays committed.
    pub fn end_tx(&self, key: Option<TxKey>) -> Result<()> {
        let Some(key) = key else {
            return Ok(());
        };
        if !self.tx.borrow().is_current(key) {
            return Ok(());
        }

        if let Err(e) = self.commit() {
            self.discard_tx();
            self.tx.borrow_mut().clear_queue();
            return Err(e);
        }

        let finished = self.tx.borrow_mut().take();
        if let Some(tx) = finished {
            if !tx.steps.is_empty() {
                debug!(steps = tx.steps.len(), "history entry recorded");
                self.history.borrow_mut().push(tx.steps);
            }
        }

        self.flush_queue()
    }

    /// Abandon the open transaction, restoring the store and indexes.
    ///
    /// Never notifies listeners or writes history. Fails with
    /// [`DbError::CommitInProgress`] when called from a listener, since the
    /// commit being delivered can no longer be undone.
    pub fn rollback(&self) -> Result<()> {
        if self.is_committing() {
            return Err(DbError::CommitInProgress);
        }
        self.discard_tx();
        Ok(())
    }

    fn discard_tx(&self) {
        let Some(tx) = self.tx.borrow_mut().take() else {
            return;
        };

        *self.store.borrow_mut() = tx.snapshot;

        let mut indexes = self.indexes.borrow_mut();
        for action in tx.rollbacks.into_iter().rev() {
            match action {
                RollbackAction::IndexRepair {
                    collection,
                    remove,
                    insert,
                } => {
                    if let Some(set) = indexes.get_mut(&collection) {
                        set.apply(&remove, &insert);
                    }
                }
            }
        }

        debug!("transaction rolled back");
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx.borrow().is_open()
    }

    /// Run `f` as one transaction.
    ///
    /// An error from `f` rolls back everything it did. Fails with
    /// [`DbError::TransactionInProgress`] if a transaction is already open.
    pub fn tx<T, E, F>(&self, options: Option<TxOptions>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Db) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        let key = self
            .begin_tx(options)
            .ok_or(DbError::TransactionInProgress)?;

        match f(self) {
            Ok(value) => {
                self.end_tx(Some(key))?;
                Ok(value)
            }
            Err(e) => {
                let open = self.tx.borrow().is_current(key);
                if open {
                    self.discard_tx();
                }
                Err(e)
            }
        }
    }

    /// Run `f` as one transaction recorded in the undo history.
    pub fn undoable_tx<T, E, F>(&self, options: Option<TxOptions>, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Db) -> std::result::Result<T, E>,
        E: From<DbError>,
    {
        let options = options.unwrap_or_else(|| self.default_options.clone());
        self.tx(Some(options.undoable()), f)
    }

    fn commit(&self) -> Result<()> {
        let (prev, changes, changed_fields, options) = {
            let mut tx = self.tx.borrow_mut();
            if tx.is_committing() {
                return Ok(());
            }
            let Some(t) = tx.current_mut() else {
                return Ok(());
            };
            (
                t.snapshot.clone(),
                std::mem::take(&mut t.changes),
                std::mem::take(&mut t.changed_fields),
                t.options.clone(),
            )
        };

        let next = self.snapshot();
        if prev.ptr_eq(&next) {
            return Ok(());
        }

        trace!(collections = changes.len(), "committing transaction");
        let _guard = CommitGuard::enter(&self.tx);

        if !options.no_event {
            let context = options.context.unwrap_or_default();
            self.listeners.notify(
                self,
                &Commit {
                    prev: &prev,
                    next: &next,
                    changes: &changes,
                    changed_fields: &changed_fields,
                    context: &context,
                },
            );
        }

        self.schedule_writes(&prev, &next)
    }

    fn flush_queue(&self) -> Result<()> {
        if !self.tx.borrow_mut().start_drain() {
            return Ok(());
        }
        let _guard = DrainGuard(&self.tx);

        let mut drained = 0;
        loop {
            let next = self.tx.borrow_mut().dequeue();
            let Some((operation, options)) = next else {
                return Ok(());
            };

            drained += 1;
            if drained > MAX_QUEUED_OPERATIONS {
                self.tx.borrow_mut().clear_queue();
                warn!(drained, "replay queue overrun");
                return Err(DbError::QueueOverrun(drained));
            }

            trace!(operation = operation.name(), "replaying deferred operation");
            if let Err(e) = apply_operation(self, operation, options) {
                self.tx.borrow_mut().clear_queue();
                return Err(e);
            }
        }
    }

    // --- History ---

    /// Revert the last undoable transaction.
    pub fn undo(&self) -> Result<()> {
        if self.tx.borrow().is_open() {
            return Err(DbError::HistoryDuringTransaction("undo"));
        }
        let entry = self.history.borrow().undo_entry().cloned();
        let Some(entry) = entry else {
            return Ok(());
        };

        debug!(steps = entry.len(), "undo");
        self.replay(|db| {
            for step in entry.iter().rev() {
                apply_operation(db, step.undo.clone(), None)?;
            }
            db.history.borrow_mut().step_back();
            Ok(())
        })
    }

    /// Reapply the last undone transaction.
    pub fn redo(&self) -> Result<()> {
        if self.tx.borrow().is_open() {
            return Err(DbError::HistoryDuringTransaction("redo"));
        }
        let entry = self.history.borrow().redo_entry().cloned();
        let Some(entry) = entry else {
            return Ok(());
        };

        debug!(steps = entry.len(), "redo");
        self.replay(|db| {
            for step in &entry {
                apply_operation(db, step.redo.clone(), None)?;
            }
            db.history.borrow_mut().step_forward();
            Ok(())
        })
    }

    fn replay(&self, f: impl FnOnce(&Db) -> Result<()>) -> Result<()> {
        let index = self.history.borrow().index();
        self.tx.borrow_mut().set_in_undo_redo(true);
        let result = self.tx(None, f);
        self.tx.borrow_mut().set_in_undo_redo(false);
        if result.is_err() {
            self.history.borrow_mut().set_index(index);
        }
        result
    }

    pub fn can_undo(&self) -> bool {
        self.history.borrow().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.borrow().can_redo()
    }

    pub fn history_len(&self) -> usize {
        self.history.borrow().len()
    }

    pub fn history_index(&self) -> usize {
        self.history.borrow().index()
    }

    pub fn clear_history(&self) {
        self.history.borrow_mut().clear();
    }

    // --- Listeners ---

    /// Listen to every commit.
    pub fn subscribe_db(&self, handler: impl Fn(&Db, &DbEvent<'_>) + 'static) -> ListenerId {
        self.listeners.add_db(Rc::new(handler))
    }

    /// Listen to commits replacing a collection.
    pub fn subscribe_collection(
        &self,
        collection: &str,
        handler: impl Fn(&Db, &CollectionEvent<'_>) + 'static,
    ) -> ListenerId {
        self.listeners.add_collection(collection, Rc::new(handler))
    }

    /// Listen to commits changing a document.
    pub fn subscribe_doc(
        &self,
        collection: &str,
        id: &str,
        handler: impl Fn(&Db, &DocEvent<'_>) + 'static,
    ) -> ListenerId {
        self.listeners.add_doc(collection, id, Rc::new(handler))
    }

    /// Listen to commits changing one field of a document.
    pub fn subscribe_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        handler: impl Fn(&Db, &FieldEvent<'_>) + 'static,
    ) -> ListenerId {
        self.listeners.add_field(collection, id, field, Rc::new(handler))
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    // --- Storage ---

    fn read_collection_blob(&self, schema: &CollectionSchema) -> Result<Option<Collection>> {
        let (Some(store), Some(key)) = (&self.blob_store, schema.storage_key()) else {
            return Ok(None);
        };
        match store.load_blob(key)? {
            Some(bytes) => decode_collection(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn schedule_writes(&self, prev: &Snapshot, next: &Snapshot) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        let names = self.collection_names();
        for name in &names {
            let Some(col) = next.get(name) else {
                continue;
            };
            if prev.get(name).is_some_and(|p| p.ptr_eq(col)) {
                continue;
            }
            let schema = self.schema(name)?;
            if let Some(key) = schema.storage_key() {
                writer.schedule(key, col.clone(), schema.storage_debounce())?;
            }
        }
        Ok(())
    }

    /// Read a collection's stored contents without installing them.
    pub fn load_collection_from_storage(&self, name: &str) -> Result<Option<Collection>> {
        let schema = self.schema(name)?;
        self.read_collection_blob(&schema)
    }

    /// Write a collection now, bypassing the debounce.
    pub fn save_collection_to_storage(&self, name: &str) -> Result<()> {
        let schema = self.schema(name)?;
        let (Some(store), Some(key)) = (&self.blob_store, schema.storage_key()) else {
            return Ok(());
        };
        let collection = self.contents(name)?;
        store.save_blob(key, &encode_collection(&collection)?)?;
        debug!(collection = name, key, "collection saved");
        Ok(())
    }

    /// Write every collection with a storage key now.
    pub fn save_to_storage(&self) -> Result<()> {
        for name in self.collection_names() {
            self.save_collection_to_storage(&name)?;
        }
        Ok(())
    }

    /// Write every pending debounced save and wait for it.
    pub fn flush_storage(&self) -> Result<()> {
        match &self.writer {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tx = self.tx.borrow();
        f.debug_struct("Db")
            .field("collections", &self.names.borrow())
            .field("in_transaction", &tx.is_open())
            .field("replaying_history", &tx.in_undo_redo())
            .field("history", &self.history.borrow().len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

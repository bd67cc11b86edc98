//! # localdb
//!
//! An embedded, in-memory, transactional document store.
//!
//! ## Core Concepts
//!
//! - **Collections**: Named maps of id to immutable [`Document`]s, with sorted
//!   indexes on chosen fields
//! - **Computes**: Derived fields resolved to a fixed point on every update,
//!   and foreign computes keeping other collections in sync
//! - **Transactions**: Atomic groups of mutations that commit or roll back
//!   as one, with deferred replay of writes issued by listeners
//! - **Listeners**: Change notifications per database, collection, document
//!   or field
//! - **History**: Undo and redo of transactions marked undoable
//! - **Storage**: Debounced persistence of collections to a [`BlobStore`]
//!
//! ## Example
//!
//! ```ignore
//! use localdb::{CollectionConfig, Db, DbConfig, Document, FieldConfig, IndexDirection, Patch};
//! use serde_json::json;
//!
//! let db = Db::new(DbConfig::default())?;
//! db.define_collection(
//!     "person",
//!     CollectionConfig::new()
//!         .field("name", FieldConfig::string())
//!         .field("age", FieldConfig::number().index(IndexDirection::Asc)),
//!     None,
//! )?;
//!
//! db.set_doc("person", Document::from_value(json!({"id": "p1", "name": "Ann", "age": 30}))?, None)?;
//! db.subscribe_doc("person", "p1", |_db, event| println!("{:?}", event.next));
//! db.update_doc("person", "p1", Patch::new().set("age", 31), None)?;
//! ```

pub mod blobs;
pub mod compute;
pub mod db;
pub mod error;
pub mod history;
pub mod index;
pub mod operations;
pub mod query;
pub mod schema;
pub mod subscriptions;
pub mod transaction;
pub mod types;

// Re-exports
pub use blobs::{decode_collection, encode_collection, BlobStore, FileBlobStore, MemoryBlobStore};
pub use compute::MAX_COMPUTE_ROUNDS;
pub use db::{Db, DbConfig};
pub use error::{DbError, Result};
pub use history::{HistoryEntry, HistoryManager};
pub use index::{compare_nil, default_comparator, Comparator, SortedIndex};
pub use operations::{apply_operation, CollectionUpdate, DocUpdate, HistoryStep, Operation};
pub use query::Query;
pub use schema::{
    CollectionConfig, CollectionSchema, ComputeRule, FieldConfig, FieldKind, ForeignComputeRule,
    IndexDirection, DEFAULT_STORAGE_DEBOUNCE,
};
pub use subscriptions::{CollectionEvent, DbEvent, DocEvent, FieldEvent, ListenerId};
pub use transaction::{TxKey, MAX_QUEUED_OPERATIONS};
pub use types::{
    ChangeSet, ChangedFields, Collection, DocChange, DocChanges, Document, Fields, Patch,
    Snapshot, TxContext, TxOptions, ID_FIELD,
};

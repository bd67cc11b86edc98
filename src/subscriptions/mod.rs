//! Change notifications.
//!
//! Listeners register at four granularities:
//! - the whole database (every commit)
//! - one collection (when its contents were replaced)
//! - one document (when its version changed)
//! - one field of one document (when its value changed)
//!
//! Each commit runs one notification pass, after the store is consistent.
//! Mutations issued by a handler are deferred until the pass completes.
//!
//! # Example
//!
//! ```ignore
//! let id = db.subscribe_field("person", "p1", "age", |_db, event| {
//!     println!("age {:?} -> {:?}", event.prev, event.next);
//! });
//! db.update_doc("person", "p1", Patch::new().set("age", 11), None)?;
//! db.unsubscribe(id);
//! ```

mod manager;
mod types;

pub(crate) use manager::{Commit, ListenerRegistry};
pub use types::{
    CollectionEvent, CollectionListener, DbEvent, DbListener, DocEvent, DocListener, FieldEvent,
    FieldListener, ListenerId,
};

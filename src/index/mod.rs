//! Sorted per-field indexes.
//!
//! Every indexed field of a collection keeps a [`SortedIndex`]. Mutations
//! patch the indexes in place; rollback repairs them with the inverse
//! remove/insert lists recorded by the transaction.

mod comparators;
mod sorted;

pub use comparators::{compare_nil, default_comparator, directed, Comparator};
pub use sorted::SortedIndex;

use crate::schema::CollectionSchema;
use crate::types::{Collection, Document};
use std::collections::BTreeMap;

/// All indexes of one collection, by field.
#[derive(Clone, Debug, Default)]
pub(crate) struct CollectionIndexes {
    indexes: BTreeMap<String, SortedIndex>,
}

impl CollectionIndexes {
    /// Build every index declared by the schema over the collection.
    pub fn build(schema: &CollectionSchema, collection: &Collection) -> Self {
        let indexes = schema
            .indexed_fields()
            .map(|(field, comparator)| {
                let index = SortedIndex::build(field, comparator.clone(), collection.docs().cloned());
                (field.to_string(), index)
            })
            .collect();
        Self { indexes }
    }

    pub fn get(&self, field: &str) -> Option<&SortedIndex> {
        self.indexes.get(field)
    }

    /// Remove then insert on every index.
    pub fn apply(&mut self, remove: &[Document], insert: &[Document]) {
        for index in self.indexes.values_mut() {
            index.remove_many(remove);
            index.insert_many(insert.iter().cloned());
        }
    }
}

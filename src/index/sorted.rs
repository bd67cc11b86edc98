//! Comparator-ordered document sequence.

use super::comparators::Comparator;
use crate::types::Document;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// Documents of one collection ordered by one field.
///
/// Equal keys keep their insertion order. Removal locates a document by
/// identity within its run of equal keys, never by id.
#[derive(Clone)]
pub struct SortedIndex {
    field: String,
    comparator: Comparator,
    docs: Vec<Document>,
}

impl SortedIndex {
    /// Build an index from an unordered set of documents.
    pub fn build(
        field: impl Into<String>,
        comparator: Comparator,
        docs: impl IntoIterator<Item = Document>,
    ) -> Self {
        let field = field.into();
        let mut docs: Vec<Document> = docs.into_iter().collect();
        docs.sort_by(|a, b| comparator(a.get(&field), b.get(&field)));
        Self {
            field,
            comparator,
            docs,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    fn key_cmp(&self, doc: &Document, key: Option<&Value>) -> Ordering {
        (self.comparator)(doc.get(&self.field), key)
    }

    /// First position whose key is greater than `key`.
    fn upper_bound(&self, key: Option<&Value>) -> usize {
        self.docs
            .partition_point(|d| self.key_cmp(d, key) != Ordering::Greater)
    }

    /// First position whose key is not less than `key`.
    fn lower_bound(&self, key: Option<&Value>) -> usize {
        self.docs
            .partition_point(|d| self.key_cmp(d, key) == Ordering::Less)
    }

    /// Insert after every document with an equal key.
    pub fn insert_one(&mut self, doc: Document) {
        let pos = self.upper_bound(doc.get(&self.field));
        self.docs.insert(pos, doc);
    }

    pub fn insert_many(&mut self, docs: impl IntoIterator<Item = Document>) {
        for doc in docs {
            self.insert_one(doc);
        }
    }

    /// Remove one document. Returns false if it is not in the index.
    pub fn remove_one(&mut self, doc: &Document) -> bool {
        let key = doc.get(&self.field);
        let (lo, hi) = (self.lower_bound(key), self.upper_bound(key));

        let found = (lo..hi)
            .find(|&i| self.docs[i].ptr_eq(doc))
            .or_else(|| (lo..hi).find(|&i| self.docs[i] == *doc));

        match found {
            Some(i) => {
                self.docs.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn remove_many<'a>(&mut self, docs: impl IntoIterator<Item = &'a Document>) {
        for doc in docs {
            self.remove_one(doc);
        }
    }

    /// Documents in index order.
    pub fn as_slice(&self) -> &[Document] {
        &self.docs
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.docs.clone()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Documents between two keys, in index order.
    ///
    /// Bounds are positions in index order, so for a descending index the
    /// start key is the larger value.
    pub fn range(&self, start: Bound<&Value>, end: Bound<&Value>) -> &[Document] {
        let lo = match start {
            Bound::Included(key) => self.lower_bound(Some(key)),
            Bound::Excluded(key) => self.upper_bound(Some(key)),
            Bound::Unbounded => 0,
        };
        let hi = match end {
            Bound::Included(key) => self.upper_bound(Some(key)),
            Bound::Excluded(key) => self.lower_bound(Some(key)),
            Bound::Unbounded => self.docs.len(),
        };
        if lo >= hi {
            return &[];
        }
        &self.docs[lo..hi]
    }

    /// Number of documents between two keys.
    pub fn count_range(&self, start: Bound<&Value>, end: Bound<&Value>) -> usize {
        self.range(start, end).len()
    }
}

impl fmt::Debug for SortedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedIndex")
            .field("field", &self.field)
            .field("len", &self.docs.len())
            .finish()
    }
}

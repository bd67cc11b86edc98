//! Core value types for the document store.

use crate::error::{DbError, Result};
use im::OrdMap;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Field map of a document. An absent key means the field is unset.
pub type Fields = serde_json::Map<String, Value>;

/// Opaque payload threaded through every notification of a transaction.
pub type TxContext = Fields;

/// Name of the identity field every document carries.
pub const ID_FIELD: &str = "id";

/// An immutable document.
///
/// Cloning is cheap and shares the underlying field map. Two documents compare
/// equal when their fields are equal; [`Document::ptr_eq`] checks identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Document(Arc<Fields>);

impl Document {
    /// Wrap a field map.
    pub fn new(fields: Fields) -> Self {
        Document(Arc::new(fields))
    }

    /// Build a document from a JSON object carrying a string `id`.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => {
                let doc = Document::new(fields);
                doc.require_id()?;
                Ok(doc)
            }
            other => Err(DbError::InvalidDocument(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    /// The document id, if present and a string.
    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub(crate) fn require_id(&self) -> Result<&str> {
        self.id()
            .ok_or_else(|| DbError::InvalidDocument("document has no string id".into()))
    }

    /// Get a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// All fields.
    pub fn fields(&self) -> &Fields {
        &self.0
    }

    /// Whether both handles point at the same document version.
    pub fn ptr_eq(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Convert to a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object((*self.0).clone())
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Document({})", Value::Object((*self.0).clone()))
    }
}

impl TryFrom<Value> for Document {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self> {
        Document::from_value(value)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Fields::deserialize(deserializer).map(Document::new)
    }
}

/// A partial update. `None` removes the field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Patch(BTreeMap<String, Option<Value>>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a field.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), Some(value.into()));
        self
    }

    /// Builder: remove a field.
    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), None);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Option<Value>) {
        self.0.insert(field.into(), value);
    }

    /// The entry for `field`: `None` if the patch does not touch it,
    /// `Some(None)` if it removes it.
    pub fn get(&self, field: &str) -> Option<&Option<Value>> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge another patch into this one; later entries win.
    pub(crate) fn merge(&mut self, other: Patch) {
        self.0.extend(other.0);
    }

    /// A patch setting every field of a map.
    pub fn from_fields(fields: &Fields) -> Self {
        fields
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect()
    }
}

impl FromIterator<(String, Option<Value>)> for Patch {
    fn from_iter<I: IntoIterator<Item = (String, Option<Value>)>>(iter: I) -> Self {
        Patch(iter.into_iter().collect())
    }
}

impl TryFrom<Value> for Patch {
    type Error = DbError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(fields.into_iter().map(|(k, v)| (k, Some(v))).collect()),
            other => Err(DbError::InvalidDocument(format!(
                "expected an object patch, got {}",
                other
            ))),
        }
    }
}

/// The documents of one collection, keyed by id.
///
/// Replacing a document produces a new collection sharing every other entry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Collection(Arc<OrdMap<String, Document>>);

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a collection, keying each document by its id.
    pub fn from_docs(docs: impl IntoIterator<Item = Document>) -> Result<Self> {
        let mut map = OrdMap::new();
        for doc in docs {
            let id = doc.require_id()?.to_string();
            map.insert(id, doc);
        }
        Ok(Collection(Arc::new(map)))
    }

    pub(crate) fn from_map(map: OrdMap<String, Document>) -> Self {
        Collection(Arc::new(map))
    }

    pub(crate) fn to_map(&self) -> OrdMap<String, Document> {
        (*self.0).clone()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn docs(&self) -> impl Iterator<Item = &Document> {
        self.0.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Document)> {
        self.0.iter()
    }

    /// A new collection with `doc` stored under `id`.
    pub(crate) fn with_doc(&self, id: &str, doc: Document) -> Self {
        Collection(Arc::new(self.0.update(id.to_string(), doc)))
    }

    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Convert to a JSON object keyed by id.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(id, doc)| (id.clone(), doc.to_value()))
                .collect(),
        )
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter())
    }
}

impl<'de> Deserialize<'de> for Collection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = BTreeMap::<String, Document>::deserialize(deserializer)?;
        Ok(Collection::from_map(map.into_iter().collect()))
    }
}

/// One consistent version of the whole database: collection name to contents.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Snapshot(Arc<OrdMap<String, Collection>>);

impl Snapshot {
    pub fn get(&self, collection: &str) -> Option<&Collection> {
        self.0.get(collection)
    }

    pub fn contains(&self, collection: &str) -> bool {
        self.0.contains_key(collection)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn with_collection(&self, name: &str, collection: Collection) -> Self {
        Snapshot(Arc::new(self.0.update(name.to_string(), collection)))
    }

    pub(crate) fn without_collection(&self, name: &str) -> Self {
        Snapshot(Arc::new(self.0.without(name)))
    }

    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Convert to a JSON object of collections.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(name, col)| (name.clone(), col.to_value()))
                .collect(),
        )
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter())
    }
}

/// Per-document change payloads of one collection. `None` marks a deletion.
pub type DocChanges = BTreeMap<String, Option<Patch>>;

/// Change payloads of a transaction, by collection.
pub type ChangeSet = BTreeMap<String, DocChanges>;

/// Names of the fields a transaction touched, by collection.
pub type ChangedFields = BTreeMap<String, BTreeSet<String>>;

/// A `{next, prev}` pair handed to foreign compute rules.
///
/// `next == None` means the document was deleted, `prev == None` that it was
/// created.
#[derive(Clone, Debug, PartialEq)]
pub struct DocChange {
    pub next: Option<Document>,
    pub prev: Option<Document>,
}

/// Options for a mutation or a transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxOptions {
    /// Record an undo/redo entry when the transaction commits.
    pub undoable: bool,
    /// Skip the notification pass of the transaction.
    pub no_event: bool,
    /// Skip updates of missing documents instead of failing.
    pub ignore_not_found: bool,
    /// Skip deletes of missing documents instead of failing.
    pub idempotent: bool,
    /// Payload handed to every listener.
    pub context: Option<TxContext>,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn undoable(mut self) -> Self {
        self.undoable = true;
        self
    }

    pub fn no_event(mut self) -> Self {
        self.no_event = true;
        self
    }

    pub fn ignore_not_found(mut self) -> Self {
        self.ignore_not_found = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_context(mut self, context: TxContext) -> Self {
        self.context = Some(context);
        self
    }
}

//! Collection persistence.
//!
//! Collections with a storage key are serialized to JSON and written as
//! opaque blobs through a [`BlobStore`]. Writes are scheduled on commit and
//! debounced per key by a background writer, so a burst of commits costs one
//! write.

mod memory;
mod storage;
mod writer;

pub use memory::MemoryBlobStore;
pub use storage::FileBlobStore;
pub(crate) use writer::CollectionWriter;

use crate::error::{DbError, Result};
use crate::types::{Collection, Document};
use std::collections::BTreeMap;

/// Key-value blob storage used for persistence.
pub trait BlobStore: Send + Sync {
    /// Load the blob stored under `key`, if any.
    fn load_blob(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `bytes` under `key`, replacing any previous blob.
    fn save_blob(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Serialize a collection as a JSON object keyed by id.
pub fn encode_collection(collection: &Collection) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(collection)?)
}

/// Parse a collection written by [`encode_collection`].
pub fn decode_collection(bytes: &[u8]) -> Result<Collection> {
    let docs: BTreeMap<String, Document> =
        serde_json::from_slice(bytes).map_err(|e| DbError::Deserialization(e.to_string()))?;
    Collection::from_docs(docs.into_values())
}

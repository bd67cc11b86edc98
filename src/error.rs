//! Error types for the document store.

use thiserror::Error;

/// Main error type for database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("A transaction is already in progress")]
    TransactionInProgress,

    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: String },

    #[error("Index not found: {collection}/{field}")]
    IndexNotFound { collection: String, field: String },

    #[error("Invalid collection config: {0}")]
    InvalidConfig(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Too many compute loops on {collection}/{id} ({rounds} rounds)")]
    ComputeDiverged {
        collection: String,
        id: String,
        rounds: usize,
    },

    #[error("Too many queued operations ({0})")]
    QueueOverrun(usize),

    #[error("Cannot roll back while a commit is being delivered")]
    CommitInProgress,

    #[error("Cannot {0} during a transaction")]
    HistoryDuringTransaction(&'static str),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid blob format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Storage directory is locked by another process")]
    Locked,

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl DbError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        DbError::DocumentNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;

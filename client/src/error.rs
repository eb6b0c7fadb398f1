//! Error taxonomy of the client.
//!
//! Local failures ([`SyncError::Validation`], [`SyncError::Storage`]) are
//! returned to whoever called the operation. Sync-pass failures
//! ([`TransportError`], server rejections) travel on the coordinator's event
//! channel instead. None of them is fatal: every error leaves the store
//! consistent and retryable.

use tally_engine::{Partition, SchemaVersion, ValidationErrors};

/// Local persistence failed. Nothing was partially written.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("{partition} record already exists: {key}")]
    Conflict { partition: Partition, key: String },

    #[error("could not encode record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration to version {version} refused: {reason}")]
    MigrationRefused {
        version: SchemaVersion,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

/// SQLite result code for a full database or disk.
const SQLITE_FULL: &str = "13";

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(SQLITE_FULL) {
                return StorageError::QuotaExceeded(db_err.message().to_string());
            }
        }
        StorageError::Database(err)
    }
}

/// The request never got a usable answer from the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("offline and nothing cached")]
    Offline,

    #[error("server unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out")]
    Timeout,

    #[error("server responded with status {0}")]
    Status(u16),

    #[error("could not decode server response: {0}")]
    Decode(String),

    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server rejected {client_id}: {reason}")]
    ServerRejection { client_id: String, reason: String },

    #[error("engine error: {0}")]
    Engine(tally_engine::Error),
}

impl From<tally_engine::Error> for SyncError {
    fn from(err: tally_engine::Error) -> Self {
        match err {
            tally_engine::Error::Validation(errors) => SyncError::Validation(errors),
            other => SyncError::Engine(other),
        }
    }
}

impl SyncError {
    /// Whether retrying the same operation later may succeed without the
    /// user changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Storage(StorageError::Database(_)))
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, SyncError>;

//! Storage Module - dauerhafte Ablage für Identität und Anrufprotokoll
//!
//! Dieses Modul verwaltet:
//! - Key-Value Persistenz (SQLite oder In-Memory)
//! - Das Append-Only Anrufprotokoll
//! - Die lokale Session-Identität
//!

mod call_log;
mod identity;
mod memory;
mod sqlite;

pub use call_log::{CallLogEntry, CallLogStore, CALL_LOG_KEY};
pub use identity::{IdentityError, IdentityStore, IDENTITY_KEY};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not determine app data directory")]
    NoDataDirectory,

    #[error("Write rejected by storage backend: {0}")]
    WriteFailed(String),
}

// ============================================================================
// KEY-VALUE CONTRACT
// ============================================================================

/// Dauerhafter Key-Value Speicher, der Neustarts überlebt
pub trait KeyValueStore: Send + Sync {
    /// Liest den Wert zu `key`, `None` falls nicht vorhanden
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Schreibt (oder überschreibt) den Wert zu `key`
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

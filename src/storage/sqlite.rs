//! SQLite Key-Value Store
//!
//! Speichert Identität und Anrufprotokoll in einer lokalen
//! SQLite-Datenbank im App-Datenverzeichnis.

use super::{KeyValueStore, StorageError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// SQLite-Datenbank mit einer einzigen `kv` Tabelle (Thread-safe durch Mutex)
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Öffnet oder erstellt die Datenbank im Standard-Datenverzeichnis
    pub fn open() -> Result<Self, StorageError> {
        let db_path = Self::default_path()?;
        Self::open_at(&db_path)
    }

    /// Öffnet oder erstellt die Datenbank unter `db_path`
    pub fn open_at(db_path: &Path) -> Result<Self, StorageError> {
        // Parent-Verzeichnis erstellen
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening database at {:?}", db_path);

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// In-Memory Datenbank (Tests und flüchtige Sessions)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    fn default_path() -> Result<PathBuf, StorageError> {
        let mut path = crate::config::default_data_dir()?;
        path.push("peercall.db");
        Ok(path)
    }

    /// Initialisiert das Datenbank-Schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                r#"
                SELECT value FROM kv WHERE key = ?1
                "#,
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO kv (key, value)
            VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
            params![key, value],
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Anrufprotokoll
//!
//! Append-Only Historie beendeter Anrufe. Neue Einträge werden vorne
//! eingefügt und die komplette Historie wird nach jedem Append
//! persistiert. Einträge werden nie verändert oder gelöscht.

use super::{KeyValueStore, StorageError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key unter dem die Historie als JSON-Array abgelegt wird
pub const CALL_LOG_KEY: &str = "callLogs";

// ============================================================================
// CALL LOG ENTRY
// ============================================================================

/// Ein beendeter Anruf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogEntry {
    pub remote_peer_id: String,
    pub duration_seconds: u64,
    pub ended_at: DateTime<Utc>,
}

// ============================================================================
// CALL LOG STORE
// ============================================================================

struct LogState {
    entries: Vec<CallLogEntry>,
    /// In-Memory Historie ist neuer als die persistierte
    dirty: bool,
}

/// Anrufprotokoll mit In-Memory Spiegel und Write-Through Persistenz
pub struct CallLogStore {
    kv: Arc<dyn KeyValueStore>,
    state: Mutex<LogState>,
}

impl CallLogStore {
    /// Lädt die persistierte Historie (leer falls keine existiert)
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, StorageError> {
        let entries = Self::read(kv.as_ref())?;
        tracing::info!("Loaded call log with {} entries", entries.len());

        Ok(Self {
            kv,
            state: Mutex::new(LogState {
                entries,
                dirty: false,
            }),
        })
    }

    /// Gibt die persistierte Historie zurück, neuester Eintrag zuerst
    pub fn load(&self) -> Result<Vec<CallLogEntry>, StorageError> {
        Self::read(self.kv.as_ref())
    }

    /// Gibt die In-Memory Historie zurück, inklusive noch nicht
    /// persistierter Einträge
    pub fn entries(&self) -> Vec<CallLogEntry> {
        self.state.lock().entries.clone()
    }

    /// Fügt einen Eintrag vorne an und persistiert die Historie.
    ///
    /// Schlägt das Schreiben fehl, bleibt der Eintrag im Speicher und
    /// wird beim nächsten erfolgreichen `append`/`flush` mitgeschrieben.
    pub fn append(&self, entry: CallLogEntry) -> Result<(), StorageError> {
        // Lock über den Schreibvorgang halten: Append N+1 darf nie vor N landen
        let mut state = self.state.lock();
        tracing::info!(
            "Call log: {} ({}s)",
            entry.remote_peer_id,
            entry.duration_seconds
        );
        state.entries.insert(0, entry);
        state.dirty = true;
        self.persist(&mut state)
    }

    /// Schreibt eine nach einem Fehler noch ausstehende Historie erneut
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        self.persist(&mut state)
    }

    /// Gibt zurück ob ungeschriebene Einträge existieren
    pub fn has_unsaved_entries(&self) -> bool {
        self.state.lock().dirty
    }

    fn persist(&self, state: &mut LogState) -> Result<(), StorageError> {
        let json = serde_json::to_string(&state.entries)?;
        match self.kv.set(CALL_LOG_KEY, &json) {
            Ok(()) => {
                state.dirty = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to persist call log: {}", e);
                Err(e)
            }
        }
    }

    fn read(kv: &dyn KeyValueStore) -> Result<Vec<CallLogEntry>, StorageError> {
        match kv.get(CALL_LOG_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for CallLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CallLogStore")
            .field("entries", &state.entries.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

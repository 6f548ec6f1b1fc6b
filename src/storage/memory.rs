//! Flüchtiger Key-Value Store

use super::{KeyValueStore, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// HashMap-basierter Store ohne Persistenz über den Prozess hinaus.
///
/// Schreibfehler lassen sich über [`MemoryStore::set_fail_writes`]
/// simulieren, um Persistenz-Fehlerpfade durchzuspielen.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lässt alle folgenden `set` Aufrufe fehlschlagen
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteFailed(format!("write of '{}' rejected", key)));
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

//! App-Konfiguration
//!
//! Standardwerte mit Overrides aus der Umgebung:
//! - `PEERCALL_DATA_DIR`: Verzeichnis für die Datenbank
//! - `PEERCALL_RECORDINGS_DIR`: Zielverzeichnis für exportierte Aufnahmen
//! - `PEERCALL_RECORDING_POLICY`: `manual` oder `auto`

use crate::call_engine::RecordingPolicy;
use crate::storage::StorageError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DATA_DIR_ENV: &str = "PEERCALL_DATA_DIR";
pub const RECORDINGS_DIR_ENV: &str = "PEERCALL_RECORDINGS_DIR";
pub const RECORDING_POLICY_ENV: &str = "PEERCALL_RECORDING_POLICY";

const DEFAULT_LOG_FILTER: &str = "peercall=info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub recordings_dir: PathBuf,
    pub recording_policy: RecordingPolicy,
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = default_data_dir().unwrap_or_else(|_| PathBuf::from(".peercall"));
        Self {
            recordings_dir: data_dir.join("recordings"),
            data_dir,
            recording_policy: RecordingPolicy::Manual,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Standardwerte mit Overrides aus der Prozess-Umgebung
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Variablen-Quelle
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(DATA_DIR_ENV) {
            config.data_dir = PathBuf::from(dir);
            config.recordings_dir = config.data_dir.join("recordings");
        }
        if let Some(dir) = lookup(RECORDINGS_DIR_ENV) {
            config.recordings_dir = PathBuf::from(dir);
        }
        if let Some(policy) = lookup(RECORDING_POLICY_ENV) {
            config.recording_policy = policy.parse().unwrap_or_else(|e| {
                tracing::warn!("{}, falling back to manual", e);
                RecordingPolicy::Manual
            });
        }

        config
    }

    /// Pfad der SQLite Datenbank
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("peercall.db")
    }
}

/// Plattform-Datenverzeichnis der App
pub fn default_data_dir() -> Result<PathBuf, StorageError> {
    let dirs = ProjectDirs::from("com", "peercall", "peercall").ok_or(StorageError::NoDataDirectory)?;
    Ok(dirs.data_dir().to_path_buf())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[]));
        assert_eq!(config.recording_policy, RecordingPolicy::Manual);
        assert_eq!(config.recordings_dir, config.data_dir.join("recordings"));
        assert_eq!(config.log_filter, "peercall=info");
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            (DATA_DIR_ENV, "/tmp/pc"),
            (RECORDING_POLICY_ENV, "Auto"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pc"));
        assert_eq!(config.recordings_dir, PathBuf::from("/tmp/pc/recordings"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/pc/peercall.db"));
        assert_eq!(config.recording_policy, RecordingPolicy::Auto);

        let config = AppConfig::from_lookup(lookup(&[
            (RECORDINGS_DIR_ENV, "/srv/rec"),
            (RECORDING_POLICY_ENV, "sometimes"),
        ]));
        assert_eq!(config.recordings_dir, PathBuf::from("/srv/rec"));
        assert_eq!(config.recording_policy, RecordingPolicy::Manual);
    }
}

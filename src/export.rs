//! Export von Aufnahmen
//!
//! Der Exporter bekommt den Blob und einen Dateinamen-Vorschlag und legt
//! ihn im vom Benutzer gewählten Speicher ab.

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("Export cancelled by user")]
    UserCancelled,

    #[error("Failed to write recording: {0}")]
    WriteFailed(String),
}

#[async_trait]
pub trait RecordingExporter: Send + Sync {
    /// Speichert `data` und gibt den Zielpfad zurück
    async fn export(&self, data: &[u8], suggested_name: &str) -> Result<PathBuf, ExportError>;
}

// ============================================================================
// DIRECTORY EXPORTER
// ============================================================================

/// Schreibt Aufnahmen in ein festes Verzeichnis
#[derive(Debug, Clone)]
pub struct DirectoryExporter {
    dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecordingExporter for DirectoryExporter {
    async fn export(&self, data: &[u8], suggested_name: &str) -> Result<PathBuf, ExportError> {
        let name = sanitize_filename(suggested_name);
        if name.is_empty() {
            return Err(ExportError::UserCancelled);
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ExportError::WriteFailed(e.to_string()))?;

        let path = self.dir.join(name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ExportError::WriteFailed(e.to_string()))?;

        tracing::info!("Wrote {} bytes to {:?}", data.len(), path);
        Ok(path)
    }
}

/// Entfernt Pfadtrenner und Steuerzeichen aus einem Dateinamen
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect::<String>()
        .trim_start_matches('.')
        .trim()
        .to_string()
}

// ============================================================================
// TESTS
// ============================================================================

//! Media Module - Audio-Streams, Mikrofon und Wiedergabe
//!
//! Dieses Modul verwaltet:
//! - Streams mit stoppbaren Tracks, die Audio-Chunks an Sinks verteilen
//! - Die Grenze zur Mikrofon-Akquise (`MediaSource`)
//! - Die Grenze zur Wiedergabe entfernter Streams (`Playback`)
//! - Ein simuliertes Mikrofon für Demo und Tests

mod microphone;
mod stream;

pub use microphone::{SimulatedMicrophone, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use stream::{AudioChunk, MediaStream, MediaTrack};

use crate::call_engine::LegId;
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device available: {0}")]
    Unavailable(String),

    #[error("Microphone access denied")]
    PermissionDenied,
}

// ============================================================================
// COLLABORATOR CONTRACTS
// ============================================================================

/// Liefert den lokalen Mikrofon-Stream
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError>;
}

/// Spielt entfernte Streams ab
pub trait Playback: Send + Sync {
    fn play(&self, leg: LegId, stream: &MediaStream);

    /// Beendet die Wiedergabe eines einzelnen Legs
    fn stop(&self, leg: LegId);

    /// Entfernt alle Wiedergabe-Sinks
    fn stop_all(&self);
}

/// Wiedergabe ohne Ausgabegerät, protokolliert nur
#[derive(Debug, Default)]
pub struct NullPlayback;

impl Playback for NullPlayback {
    fn play(&self, leg: LegId, stream: &MediaStream) {
        tracing::debug!(
            "Playback of stream {} for leg {} ({} tracks)",
            stream.id(),
            leg,
            stream.tracks().len()
        );
    }

    fn stop(&self, leg: LegId) {
        tracing::debug!("Playback stopped for leg {}", leg);
    }

    fn stop_all(&self) {
        tracing::debug!("All playback sinks removed");
    }
}

//! Signaling Module - Verbindungsaufbau zwischen Peers
//!
//! Dieses Modul definiert die Grenze zum Peer-Connection-Provider:
//! - Session öffnen und Identität bekannt geben
//! - Eingehende Anrufe melden
//! - Ausgehende Anrufe starten
//! - Pro Anruf-Leg: annehmen, schließen, Stream- und Close-Events
//!
//! `LoopbackNetwork` ist eine In-Process Implementierung für Demo und Tests.

mod loopback;

pub use loopback::{LoopbackNetwork, LoopbackSignaling};

use crate::media::MediaStream;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling session is not open")]
    NotOpen,

    #[error("Peer unreachable: {0}")]
    PeerUnavailable(String),

    #[error("Identifier already taken: {0}")]
    IdUnavailable(String),
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Events eines einzelnen Anruf-Legs
#[derive(Debug, Clone)]
pub enum LegEvent {
    /// Audio-Stream der Gegenseite ist eingetroffen
    Stream(MediaStream),
    /// Leg wurde geschlossen (lokal oder von der Gegenseite)
    Close,
}

/// Ein ausgehandeltes Anruf-Leg. Gehört dem Signaling-Layer, die
/// Call Engine hält nur Referenzen.
pub trait CallHandle: Send + Sync {
    /// ID der Gegenseite
    fn peer(&self) -> &str;

    /// Nimmt den Anruf mit dem lokalen Stream an
    fn answer(&self, stream: &MediaStream);

    /// Schließt das Leg; beide Seiten erhalten `LegEvent::Close`
    fn close(&self);

    /// Gibt einen Event-Receiver für Stream- und Close-Events zurück
    fn subscribe(&self) -> broadcast::Receiver<LegEvent>;

    /// `true` sobald das Leg geschlossen wurde
    fn is_closed(&self) -> bool;
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Öffnet die Session, optional mit einer gespeicherten ID, und
    /// liefert die zugewiesene ID sobald die Session bereit ist
    async fn open(&self, saved_id: Option<String>) -> Result<String, SignalingError>;

    /// Gibt einen Receiver für eingehende Anrufe zurück
    fn incoming_calls(&self) -> broadcast::Receiver<Arc<dyn CallHandle>>;

    /// Startet einen ausgehenden Anruf mit dem lokalen Stream
    fn call(
        &self,
        remote_id: &str,
        local_stream: &MediaStream,
    ) -> Result<Arc<dyn CallHandle>, SignalingError>;
}

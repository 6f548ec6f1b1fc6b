//! PeerCall - P2P Audio-Anrufe
//!
//! Eine P2P Voice-Call-Bibliothek mit:
//! - Persistenter lokaler Identität
//! - Mehreren gleichzeitigen Anrufen mit gemeinsamem Mikrofon-Stream
//! - Anruf-Timer und Aufnahme über alle laufenden Anrufe
//! - SQLite-Anrufprotokoll

pub mod call_engine;
pub mod config;
pub mod export;
pub mod media;
pub mod signaling;
pub mod storage;

use call_engine::{
    AcceptOutcome, CallEngine, CallEngineError, CallEvent, LegId, SessionSnapshot,
};
use config::AppConfig;
use export::{DirectoryExporter, RecordingExporter};
use media::{MediaSource, NullPlayback, Playback, SimulatedMicrophone};
use serde::Serialize;
use signaling::{LoopbackNetwork, SignalingClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{
    CallLogEntry, CallLogStore, IdentityError, IdentityStore, KeyValueStore, MemoryStore,
    SqliteStore, StorageError,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Call(#[from] CallEngineError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging einmal pro Prozess (`RUST_LOG` plus die
/// konfigurierten Direktiven)
pub fn init_tracing(config: &AppConfig) {
    let mut filter = EnvFilter::from_default_env();
    let mut invalid = Vec::new();
    for directive in config.log_filter.split(',').filter(|d| !d.trim().is_empty()) {
        match directive.trim().parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => invalid.push(directive.to_string()),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        return;
    }
    for directive in invalid {
        tracing::warn!("Ignoring invalid log directive '{}'", directive);
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Ergebnis eines Anrufs aus einer ID-Liste
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialResult {
    pub peer: String,
    pub leg: Option<LegId>,
    pub error: Option<String>,
}

/// Application State: Identität, Anrufprotokoll und Call Engine
pub struct AppState {
    config: AppConfig,
    peer_id: String,
    call_log: Arc<CallLogStore>,
    call_engine: CallEngine,
    exporter: Arc<dyn RecordingExporter>,
}

impl AppState {
    /// Initialisiert den Application State
    pub async fn init(
        config: AppConfig,
        store: Arc<dyn KeyValueStore>,
        signaling: Arc<dyn SignalingClient>,
        media: Arc<dyn MediaSource>,
        playback: Arc<dyn Playback>,
        exporter: Arc<dyn RecordingExporter>,
    ) -> Result<Arc<Self>, AppError> {
        tracing::info!("Initializing PeerCall...");

        // Identität laden oder vom Signaling vergeben lassen
        let identity = IdentityStore::new(Arc::clone(&store));
        let peer_id = identity.ensure(signaling.as_ref()).await?;
        tracing::info!("Session open as {}", peer_id);

        let call_log = Arc::new(CallLogStore::open(store)?);

        let call_engine = CallEngine::new(
            signaling,
            media,
            playback,
            Arc::clone(&call_log),
            config.recording_policy,
        );
        call_engine.listen();

        Ok(Arc::new(Self {
            config,
            peer_id,
            call_log,
            call_engine,
            exporter,
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &CallEngine {
        &self.call_engine
    }

    // ========================================================================
    // COMMANDS - IDENTITY
    // ========================================================================

    /// Eigene ID zum Weitergeben
    pub fn my_id(&self) -> &str {
        &self.peer_id
    }

    // ========================================================================
    // COMMANDS - CALLS
    // ========================================================================

    /// Ruft alle IDs einer kommagetrennten Liste an
    pub async fn call(&self, remote_ids: &str) -> Vec<DialResult> {
        self.call_engine
            .dial_many(remote_ids)
            .await
            .into_iter()
            .map(|(peer, result)| match result {
                Ok(leg) => DialResult {
                    peer,
                    leg: Some(leg),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Call to {} failed: {}", peer, e);
                    DialResult {
                        peer,
                        leg: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect()
    }

    /// Nimmt einen wartenden Anruf an
    pub async fn accept(&self, leg: LegId) -> Result<AcceptOutcome, AppError> {
        Ok(self.call_engine.accept(leg).await?)
    }

    /// Lehnt einen wartenden Anruf ab
    pub fn reject(&self, leg: LegId) {
        self.call_engine.reject(leg);
    }

    /// Beendet einen einzelnen Anruf
    pub fn hangup(&self, leg: LegId) -> Result<(), AppError> {
        Ok(self.call_engine.hangup(leg)?)
    }

    /// Beendet alle Anrufe
    pub fn end_calls(&self) -> Result<(), AppError> {
        Ok(self.call_engine.end_all()?)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.call_engine.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.call_engine.subscribe()
    }

    /// Anruf-Dauer als `MM:SS`
    pub fn duration_readout(&self) -> String {
        self.call_engine.duration_readout()
    }

    // ========================================================================
    // COMMANDS - RECORDING
    // ========================================================================

    pub fn start_recording(&self) -> Result<usize, AppError> {
        Ok(self.call_engine.start_recording()?)
    }

    /// Stoppt die Aufnahme und exportiert sie. Schlägt der Export fehl,
    /// kann er mit `export_recording` wiederholt werden.
    pub async fn stop_recording(&self) -> Result<PathBuf, AppError> {
        let recording = self.call_engine.stop_recording()?;
        Ok(self
            .call_engine
            .export_recording_id(self.exporter.as_ref(), recording.id)
            .await?)
    }

    /// Exportiert die älteste noch nicht exportierte Aufnahme (erneut)
    pub async fn export_recording(&self) -> Result<PathBuf, AppError> {
        Ok(self
            .call_engine
            .export_recording(self.exporter.as_ref())
            .await?)
    }

    // ========================================================================
    // COMMANDS - CALL LOG
    // ========================================================================

    /// Anrufprotokoll, neuester Eintrag zuerst
    pub fn call_logs(&self) -> Vec<CallLogEntry> {
        self.call_log.entries()
    }

    /// Schreibt ein nach einem Fehler ausstehendes Protokoll erneut
    pub fn retry_call_log(&self) -> Result<(), AppError> {
        Ok(self.call_log.flush()?)
    }

    /// Beendet alle Anrufe und nimmt keine neuen mehr an
    pub fn shutdown(&self) -> Result<(), AppError> {
        tracing::info!("Shutting down session {}", self.peer_id);
        Ok(self.call_engine.shutdown()?)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("peer_id", &self.peer_id)
            .field("call_engine", &self.call_engine)
            .finish()
    }
}

// ============================================================================
// DEMO RUNNER
// ============================================================================

/// Zwei Sessions im selben Prozess: Alice ruft Bob an, nimmt 3 Sekunden
/// auf, legt auf und exportiert die Aufnahme
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    init_tracing(&config);

    let network = LoopbackNetwork::new();

    let alice_store: Arc<dyn KeyValueStore> =
        Arc::new(SqliteStore::open_at(&config.database_path())?);
    let alice = AppState::init(
        config.clone(),
        alice_store,
        Arc::new(network.client()),
        Arc::new(SimulatedMicrophone::new("alice-mic").with_tone(440.0)),
        Arc::new(NullPlayback),
        Arc::new(DirectoryExporter::new(&config.recordings_dir)),
    )
    .await?;

    let bob = AppState::init(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(network.client()),
        Arc::new(SimulatedMicrophone::new("bob-mic").with_tone(660.0)),
        Arc::new(NullPlayback),
        Arc::new(DirectoryExporter::new(&config.recordings_dir)),
    )
    .await?;

    // Bob nimmt jeden Anruf an
    let bob_engine = bob.engine().clone();
    let mut bob_events = bob.subscribe();
    let auto_answer = tokio::spawn(async move {
        while let Ok(event) = bob_events.recv().await {
            if let CallEvent::IncomingCall { leg, peer } = event {
                tracing::info!("Bob answers call from {}", peer);
                if let Err(e) = bob_engine.accept(leg).await {
                    tracing::warn!("Bob could not answer: {}", e);
                }
            }
        }
    });

    for result in alice.call(bob.my_id()).await {
        if let Some(error) = result.error {
            anyhow::bail!("Call to {} failed: {}", result.peer, error);
        }
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let tracks = alice.start_recording()?;
    tracing::info!("Alice records {} track(s)", tracks);

    tokio::time::sleep(Duration::from_secs(3)).await;
    tracing::info!("Call duration {}", alice.duration_readout());

    // Auflegen flusht die laufende Aufnahme
    alice.end_calls()?;
    let path = alice.export_recording().await?;
    tracing::info!("Recording saved to {:?}", path);

    for entry in alice.call_logs() {
        tracing::info!(
            "Call log: {} for {} at {}",
            entry.remote_peer_id,
            call_engine::format_duration(entry.duration_seconds),
            entry.ended_at.to_rfc3339()
        );
    }

    auto_answer.abort();
    alice.shutdown()?;
    bob.shutdown()?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::IDENTITY_KEY;

    async fn session(network: &LoopbackNetwork, store: Arc<dyn KeyValueStore>) -> Arc<AppState> {
        let dir = std::env::temp_dir().join(format!("peercall-app-{}", uuid::Uuid::new_v4()));
        AppState::init(
            AppConfig::default(),
            store,
            Arc::new(network.client()),
            Arc::new(SimulatedMicrophone::new("mic")),
            Arc::new(NullPlayback),
            Arc::new(DirectoryExporter::new(dir)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_identity_is_persisted_on_init() {
        let network = LoopbackNetwork::new();
        let store = Arc::new(MemoryStore::new());
        let app = session(&network, Arc::clone(&store) as Arc<dyn KeyValueStore>).await;

        assert_eq!(
            store.get(IDENTITY_KEY).unwrap().as_deref(),
            Some(app.my_id())
        );
    }

    #[tokio::test]
    async fn test_call_between_two_sessions() {
        let network = LoopbackNetwork::new();
        let alice = session(&network, Arc::new(MemoryStore::new())).await;
        let bob = session(&network, Arc::new(MemoryStore::new())).await;
        let mut bob_events = bob.subscribe();

        let input = format!(" {} , ,unknown-peer", bob.my_id());
        let results = alice.call(&input).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].leg.is_some());
        assert!(results[1].error.is_some());

        let leg = match bob_events.recv().await.unwrap() {
            CallEvent::IncomingCall { leg, peer } => {
                assert_eq!(peer, alice.my_id());
                leg
            }
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(bob.accept(leg).await.unwrap(), AcceptOutcome::Answered);

        alice.end_calls().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(alice.call_logs()[0].remote_peer_id, bob.my_id());
        assert_eq!(bob.call_logs()[0].remote_peer_id, alice.my_id());
        assert!(bob.snapshot().active.is_empty());
        assert_eq!(bob.duration_readout(), "00:00");
    }

    #[tokio::test]
    async fn test_stop_recording_exports() {
        let network = LoopbackNetwork::new();
        let alice = session(&network, Arc::new(MemoryStore::new())).await;
        let bob = session(&network, Arc::new(MemoryStore::new())).await;

        let results = alice.call(bob.my_id()).await;
        assert!(results[0].leg.is_some());
        assert!(alice.start_recording().is_ok());

        let path = alice.stop_recording().await.unwrap();
        assert!(path.exists());
        assert!(matches!(
            alice.export_recording().await,
            Err(AppError::Call(CallEngineError::NothingToExport))
        ));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
        alice.shutdown().unwrap();
    }
}

//! Call Engine
//!
//! Führt die Effekte des `SessionState` aus und besitzt alle Ressourcen
//! der Session: Call Handles, LocalStream, Remote Streams, Timer und
//! Recorder. Jeder Zustandsübergang läuft unter einem Lock; gewartet
//! wird nur auf die Mikrofon-Akquise, deren Ergebnis danach als neues
//! Event gegen den dann aktuellen Zustand geprüft wird.

use super::recorder::{Recorder, RecorderError, Recording};
use super::state::{
    Direction, Effect, Intent, LegId, LegStatus, LegSummary, RecordingPolicy, SessionEvent,
    SessionState,
};
use super::timer::{format_duration, CallTimer};
use crate::export::{ExportError, RecordingExporter};
use crate::media::{MediaError, MediaSource, MediaStream, Playback};
use crate::signaling::{CallHandle, LegEvent, SignalingClient, SignalingError};
use crate::storage::{CallLogEntry, CallLogStore, StorageError};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("Microphone unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("Signaling failure: {0}")]
    SignalingFailure(#[from] SignalingError),

    #[error("Call log could not be persisted: {0}")]
    PersistenceFailure(#[from] StorageError),

    #[error("No active call")]
    NoActiveCall,

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("No finished recording to export")]
    NothingToExport,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEvent {
    IncomingCall {
        leg: LegId,
        peer: String,
    },
    /// Gegenseite hat vor der Annahme aufgelegt
    IncomingWithdrawn {
        leg: LegId,
    },
    /// Lokal abgelehnt
    IncomingRejected {
        leg: LegId,
    },
    CallStarted {
        leg: LegId,
        peer: String,
        direction: Direction,
    },
    RemoteStream {
        leg: LegId,
    },
    CallEnded {
        leg: LegId,
        entry: CallLogEntry,
    },
    AllCallsEnded,
    TimerTick {
        elapsed: u64,
    },
    RecordingStarted {
        tracks: usize,
    },
    RecordingStopped {
        bytes: usize,
    },
    Error {
        message: String,
    },
}

/// Ergebnis von `CallEngine::accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AcceptOutcome {
    /// Leg ist jetzt aktiv
    Answered,
    /// Eine andere Annahme dieses Legs wartet noch auf das Mikrofon
    InProgress,
    AlreadyActive,
    /// Leg ist unbekannt oder bereits beendet
    NotPending,
    /// Leg wurde während der Akquise beendet
    Withdrawn,
}

/// Momentaufnahme für die Anzeige
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub pending: Vec<LegSummary>,
    pub active: Vec<LegSummary>,
    pub elapsed_seconds: u64,
    pub local_stream_live: bool,
    pub recording: bool,
}

// ============================================================================
// CALL ENGINE
// ============================================================================

struct Inner {
    state: SessionState,
    handles: HashMap<LegId, Arc<dyn CallHandle>>,
    watchers: HashMap<LegId, JoinHandle<()>>,
    local_stream: Option<MediaStream>,
    remote_streams: HashMap<LegId, MediaStream>,
    timer: CallTimer,
    recorder: Recorder,
    /// Gestoppte, noch nicht exportierte Aufnahmen, älteste zuerst
    unexported: VecDeque<Recording>,
    incoming_task: Option<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (_, watcher) in self.watchers.drain() {
            watcher.abort();
        }
        if let Some(task) = self.incoming_task.take() {
            task.abort();
        }
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    signaling: Arc<dyn SignalingClient>,
    media: Arc<dyn MediaSource>,
    playback: Arc<dyn Playback>,
    call_log: Arc<CallLogStore>,
    event_tx: broadcast::Sender<CallEvent>,
}

/// Was beim Ausführen der Effekte eines Events angefallen ist
#[derive(Default)]
struct DriveReport {
    acquire: Option<Intent>,
    dialed: Option<Result<LegId, SignalingError>>,
    persistence: Option<StorageError>,
}

impl DriveReport {
    fn persisted(self) -> Result<(), CallEngineError> {
        match self.persistence {
            Some(e) => Err(CallEngineError::PersistenceFailure(e)),
            None => Ok(()),
        }
    }
}

/// Call Session Manager
#[derive(Clone)]
pub struct CallEngine {
    shared: Arc<Shared>,
}

impl CallEngine {
    pub fn new(
        signaling: Arc<dyn SignalingClient>,
        media: Arc<dyn MediaSource>,
        playback: Arc<dyn Playback>,
        call_log: Arc<CallLogStore>,
        policy: RecordingPolicy,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::new(policy),
                    handles: HashMap::new(),
                    watchers: HashMap::new(),
                    local_stream: None,
                    remote_streams: HashMap::new(),
                    timer: CallTimer::new(),
                    recorder: Recorder::new(),
                    unexported: VecDeque::new(),
                    incoming_task: None,
                }),
                signaling,
                media,
                playback,
                call_log,
                event_tx,
            }),
        }
    }

    /// Nimmt eingehende Anrufe des Signaling Clients entgegen
    pub fn listen(&self) {
        let mut incoming = self.shared.signaling.incoming_calls();
        let weak = Arc::downgrade(&self.shared);

        let task = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(handle) => {
                        let Some(engine) = Self::upgrade(&weak) else {
                            break;
                        };
                        engine.register_incoming(handle);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} incoming call(s)", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.shared.inner.lock().incoming_task.replace(task) {
            old.abort();
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.shared.inner.lock();
        SessionSnapshot {
            pending: inner.state.pending(),
            active: inner.state.active(),
            elapsed_seconds: inner.timer.elapsed(),
            local_stream_live: inner.local_stream.as_ref().is_some_and(|s| s.is_live()),
            recording: inner.recorder.is_recording(),
        }
    }

    pub fn pending_calls(&self) -> Vec<LegSummary> {
        self.shared.inner.lock().state.pending()
    }

    pub fn active_calls(&self) -> Vec<LegSummary> {
        self.shared.inner.lock().state.active()
    }

    pub fn status(&self, leg: LegId) -> Option<LegStatus> {
        self.shared.inner.lock().state.status(leg)
    }

    /// Sekunden seit dem ersten aktiven Leg
    pub fn elapsed(&self) -> u64 {
        self.shared.inner.lock().timer.elapsed()
    }

    /// Anruf-Dauer als `MM:SS`
    pub fn duration_readout(&self) -> String {
        format_duration(self.elapsed())
    }

    pub fn is_recording(&self) -> bool {
        self.shared.inner.lock().recorder.is_recording()
    }

    // ========================================================================
    // CALL CONTROL
    // ========================================================================

    /// Registriert ein eingehendes Leg als wartend
    pub fn register_incoming(&self, handle: Arc<dyn CallHandle>) -> LegId {
        let leg = LegId::new();
        let peer = handle.peer().to_string();
        tracing::info!("Incoming call from {} ({})", peer, leg);

        let mut inner = self.shared.inner.lock();
        inner.handles.insert(leg, Arc::clone(&handle));
        self.watch_leg(&mut inner, leg, handle.as_ref());
        self.drive(&mut inner, SessionEvent::IncomingCall { leg, peer }, None);

        if handle.is_closed() {
            self.close_from_remote(&mut inner, leg);
        }
        leg
    }

    /// Nimmt ein wartendes Leg an. Mehrfache Aufrufe sind No-Ops.
    pub async fn accept(&self, leg: LegId) -> Result<AcceptOutcome, CallEngineError> {
        let report = {
            let mut inner = self.shared.inner.lock();
            match inner.state.status(leg) {
                None => return Ok(AcceptOutcome::NotPending),
                Some(LegStatus::Answering) => return Ok(AcceptOutcome::InProgress),
                Some(LegStatus::Active) => return Ok(AcceptOutcome::AlreadyActive),
                Some(LegStatus::Ringing) => {}
            }
            let at = Instant::now();
            self.drive(&mut inner, SessionEvent::AcceptRequested { leg, at }, None)
        };

        if let Some(intent) = report.acquire {
            self.acquire(intent).await?;
        }

        Ok(match self.status(leg) {
            Some(LegStatus::Active) => AcceptOutcome::Answered,
            _ => {
                tracing::warn!("Leg {} ended before it could be answered", leg);
                AcceptOutcome::Withdrawn
            }
        })
    }

    /// Lehnt ein wartendes Leg ab
    pub fn reject(&self, leg: LegId) {
        let mut inner = self.shared.inner.lock();
        self.drive(&mut inner, SessionEvent::RejectRequested { leg }, None);
    }

    /// Ruft eine entfernte ID an
    pub async fn dial(&self, remote_id: &str) -> Result<LegId, CallEngineError> {
        let peer = remote_id.trim().to_string();
        let mut report = {
            let mut inner = self.shared.inner.lock();
            self.drive(&mut inner, SessionEvent::DialRequested { peer: peer.clone() }, None)
        };

        if let Some(intent) = report.acquire.take() {
            report = self.acquire(intent).await?;
        }

        match report.dialed {
            Some(Ok(leg)) => Ok(leg),
            Some(Err(e)) => Err(e.into()),
            None => Err(SignalingError::PeerUnavailable(peer).into()),
        }
    }

    /// Ruft alle IDs einer kommagetrennten Liste gleichzeitig an
    pub async fn dial_many(&self, remote_ids: &str) -> Vec<(String, Result<LegId, CallEngineError>)> {
        let peers: Vec<String> = remote_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .collect();

        let results = futures::future::join_all(peers.iter().map(|peer| self.dial(peer))).await;
        peers.into_iter().zip(results).collect()
    }

    /// Beendet ein einzelnes Leg; unbekannte Legs sind ein No-Op
    pub fn hangup(&self, leg: LegId) -> Result<(), CallEngineError> {
        let mut inner = self.shared.inner.lock();
        let event = SessionEvent::HangupRequested {
            leg,
            at: Instant::now(),
            ended_at: Utc::now(),
        };
        self.drive(&mut inner, event, None).persisted()
    }

    /// Beendet alle aktiven Legs und gibt LocalStream und Wiedergabe frei
    pub fn end_all(&self) -> Result<(), CallEngineError> {
        let mut inner = self.shared.inner.lock();
        let event = SessionEvent::EndAllRequested {
            at: Instant::now(),
            ended_at: Utc::now(),
        };
        self.drive(&mut inner, event, None).persisted()
    }

    /// Beendet alles und stoppt das Annehmen neuer Anrufe
    pub fn shutdown(&self) -> Result<(), CallEngineError> {
        if let Some(task) = self.shared.inner.lock().incoming_task.take() {
            task.abort();
        }
        let pending: Vec<LegId> = self.pending_calls().iter().map(|l| l.id).collect();
        for leg in pending {
            self.reject(leg);
        }
        self.end_all()
    }

    // ========================================================================
    // RECORDING
    // ========================================================================

    /// Startet eine Aufnahme über LocalStream und alle Remote Streams
    pub fn start_recording(&self) -> Result<usize, CallEngineError> {
        let mut inner = self.shared.inner.lock();
        if inner.state.active_count() == 0 {
            return Err(CallEngineError::NoActiveCall);
        }
        let tracks = Self::begin_recording(&mut inner)?;
        self.emit(CallEvent::RecordingStarted { tracks });
        Ok(tracks)
    }

    /// Stoppt die Aufnahme; der Blob bleibt bis zum erfolgreichen Export erhalten
    pub fn stop_recording(&self) -> Result<Recording, CallEngineError> {
        let mut inner = self.shared.inner.lock();
        let recording = inner.recorder.stop()?;
        self.finish_recording(&mut inner, recording.clone());
        Ok(recording)
    }

    /// Älteste noch nicht exportierte Aufnahme
    pub fn pending_export(&self) -> Option<Recording> {
        self.shared.inner.lock().unexported.front().cloned()
    }

    /// Alle noch nicht exportierten Aufnahmen, älteste zuerst
    pub fn pending_exports(&self) -> Vec<Recording> {
        self.shared.inner.lock().unexported.iter().cloned().collect()
    }

    /// Exportiert die älteste gestoppte Aufnahme. Bei Fehlern bleibt sie
    /// für einen weiteren Versuch erhalten.
    pub async fn export_recording(
        &self,
        exporter: &dyn RecordingExporter,
    ) -> Result<PathBuf, CallEngineError> {
        let recording = self
            .pending_export()
            .ok_or(CallEngineError::NothingToExport)?;
        self.export(exporter, recording).await
    }

    /// Exportiert eine bestimmte gestoppte Aufnahme
    pub async fn export_recording_id(
        &self,
        exporter: &dyn RecordingExporter,
        id: Uuid,
    ) -> Result<PathBuf, CallEngineError> {
        let recording = self
            .shared
            .inner
            .lock()
            .unexported
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(CallEngineError::NothingToExport)?;
        self.export(exporter, recording).await
    }

    async fn export(
        &self,
        exporter: &dyn RecordingExporter,
        recording: Recording,
    ) -> Result<PathBuf, CallEngineError> {
        match exporter
            .export(&recording.data, &recording.suggested_filename())
            .await
        {
            Ok(path) => {
                self.shared
                    .inner
                    .lock()
                    .unexported
                    .retain(|r| r.id != recording.id);
                tracing::info!("Recording {} exported to {:?}", recording.id, path);
                Ok(path)
            }
            Err(e) => {
                tracing::warn!("Export of recording {} failed: {}", recording.id, e);
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    /// Holt das Mikrofon und speist das Ergebnis als Event ein
    async fn acquire(&self, intent: Intent) -> Result<DriveReport, CallEngineError> {
        match self.shared.media.acquire_audio().await {
            Ok(stream) => {
                let mut inner = self.shared.inner.lock();
                let event = SessionEvent::MediaAcquired {
                    intent,
                    at: Instant::now(),
                };
                Ok(self.drive(&mut inner, event, Some(stream)))
            }
            Err(e) => {
                tracing::warn!("Media acquisition failed: {}", e);
                {
                    let mut inner = self.shared.inner.lock();
                    self.drive(&mut inner, SessionEvent::MediaFailed { intent }, None);
                }
                self.emit(CallEvent::Error {
                    message: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Abonniert Stream- und Close-Events eines Legs
    fn watch_leg(&self, inner: &mut Inner, leg: LegId, handle: &dyn CallHandle) {
        let mut events = handle.subscribe();
        let weak = Arc::downgrade(&self.shared);

        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Leg {} missed {} event(s)", leg, skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => LegEvent::Close,
                };

                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                let mut inner = engine.shared.inner.lock();
                match event {
                    LegEvent::Stream(stream) => {
                        engine.drive(&mut inner, SessionEvent::RemoteStream { leg }, Some(stream));
                    }
                    LegEvent::Close => {
                        engine.close_from_remote(&mut inner, leg);
                        break;
                    }
                }
            }
        });

        if let Some(old) = inner.watchers.insert(leg, task) {
            old.abort();
        }
    }

    fn close_from_remote(&self, inner: &mut Inner, leg: LegId) {
        let event = SessionEvent::LegClosed {
            leg,
            at: Instant::now(),
            ended_at: Utc::now(),
        };
        if let Err(e) = self.drive(inner, event, None).persisted() {
            tracing::error!("Call log entry for leg {} not persisted: {}", leg, e);
            self.emit(CallEvent::Error {
                message: e.to_string(),
            });
        }
    }

    fn begin_recording(inner: &mut Inner) -> Result<usize, RecorderError> {
        let mut streams: Vec<MediaStream> = inner.local_stream.iter().cloned().collect();
        streams.extend(inner.remote_streams.values().cloned());
        inner.recorder.start(&streams)
    }

    fn finish_recording(&self, inner: &mut Inner, recording: Recording) {
        let bytes = recording.data.len();
        inner.unexported.push_back(recording);
        if inner.unexported.len() > 1 {
            tracing::info!("{} recording(s) waiting for export", inner.unexported.len());
        }
        self.emit(CallEvent::RecordingStopped { bytes });
    }

    /// Wendet ein Event an und führt alle resultierenden Effekte aus.
    /// `payload` ist der zum Event gehörende Stream (geholt oder entfernt).
    fn drive(
        &self,
        inner: &mut Inner,
        event: SessionEvent,
        mut payload: Option<MediaStream>,
    ) -> DriveReport {
        let mut report = DriveReport::default();
        let mut queue: VecDeque<Effect> = inner.state.apply(event).into();

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::AcquireMedia(intent) => {
                    report.acquire = Some(intent);
                }
                Effect::AdoptStream => {
                    if let Some(stream) = payload.take() {
                        tracing::info!("Local stream {} in use", stream.id());
                        inner.local_stream = Some(stream);
                    }
                }
                Effect::DiscardStream => {
                    if let Some(stream) = payload.take() {
                        tracing::warn!("Discarding late media acquisition {}", stream.id());
                        stream.stop();
                    }
                }
                Effect::PlaceCall { peer } => {
                    let Some(local) = inner.local_stream.clone() else {
                        report.dialed = Some(Err(SignalingError::NotOpen));
                        continue;
                    };
                    match self.shared.signaling.call(&peer, &local) {
                        Ok(handle) => {
                            let leg = LegId::new();
                            tracing::info!("Calling {} ({})", peer, leg);
                            inner.handles.insert(leg, Arc::clone(&handle));
                            self.watch_leg(inner, leg, handle.as_ref());
                            let event = SessionEvent::DialEstablished {
                                leg,
                                peer,
                                at: Instant::now(),
                            };
                            queue.extend(inner.state.apply(event));
                            report.dialed = Some(Ok(leg));
                        }
                        Err(e) => {
                            tracing::warn!("Call to {} failed: {}", peer, e);
                            queue.extend(inner.state.apply(SessionEvent::DialFailed { peer }));
                            report.dialed = Some(Err(e));
                        }
                    }
                }
                Effect::Answer(leg) => {
                    if let (Some(handle), Some(local)) =
                        (inner.handles.get(&leg), inner.local_stream.as_ref())
                    {
                        handle.answer(local);
                        tracing::info!("Answered call from {} ({})", handle.peer(), leg);
                    }
                }
                Effect::CloseLeg(leg) => {
                    if let Some(handle) = inner.handles.get(&leg) {
                        handle.close();
                    }
                }
                Effect::Forget(leg) => {
                    inner.handles.remove(&leg);
                    if let Some(watcher) = inner.watchers.remove(&leg) {
                        watcher.abort();
                    }
                    if inner.remote_streams.remove(&leg).is_some() {
                        self.shared.playback.stop(leg);
                    }
                }
                Effect::StoreRemoteStream(leg) => {
                    if let Some(stream) = payload.take() {
                        let labels: Vec<&str> = stream.tracks().iter().map(|t| t.label()).collect();
                        tracing::info!(
                            "Remote stream {} ({}) for leg {}",
                            stream.id(),
                            labels.join(", "),
                            leg
                        );
                        inner.remote_streams.insert(leg, stream);
                    }
                }
                Effect::Play(leg) => {
                    if let Some(stream) = inner.remote_streams.get(&leg) {
                        self.shared.playback.play(leg, stream);
                    }
                }
                Effect::StartTimer => {
                    inner.timer.start(self.shared.event_tx.clone());
                }
                Effect::StopTimer => {
                    inner.timer.stop();
                }
                Effect::AttachToRecording(leg) => {
                    if let Some(stream) = inner.remote_streams.get(&leg).cloned() {
                        let attached = inner.recorder.attach(&stream);
                        if attached > 0 {
                            tracing::debug!("Recording picked up {} track(s) of leg {}", attached, leg);
                        }
                    }
                }
                Effect::AutoRecord => {
                    if !inner.recorder.is_recording() {
                        tracing::info!("Starting automatic recording");
                        match Self::begin_recording(inner) {
                            Ok(tracks) => self.emit(CallEvent::RecordingStarted { tracks }),
                            Err(e) => tracing::warn!("Automatic recording not started: {}", e),
                        }
                    }
                }
                Effect::FlushRecording => {
                    if inner.recorder.is_recording() {
                        match inner.recorder.stop() {
                            Ok(recording) => {
                                tracing::info!("Last call ended, recording flushed");
                                self.finish_recording(inner, recording);
                            }
                            Err(e) => tracing::warn!("Recording flush failed: {}", e),
                        }
                    }
                }
                Effect::ReleaseLocalStream => {
                    if let Some(stream) = inner.local_stream.take() {
                        stream.stop();
                        tracing::info!("Local stream {} released", stream.id());
                    }
                }
                Effect::TeardownPlayback => {
                    inner.remote_streams.clear();
                    self.shared.playback.stop_all();
                }
                Effect::AppendLog(entry) => {
                    if let Err(e) = self.shared.call_log.append(entry) {
                        tracing::error!("Failed to persist call log: {}", e);
                        report.persistence = Some(e);
                    }
                }
                Effect::Emit(event) => self.emit(event),
            }
        }

        debug_assert!(inner.state.invariants_hold());
        report
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, SimulatedMicrophone};
    use crate::signaling::{LoopbackNetwork, LoopbackSignaling};
    use crate::storage::{KeyValueStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingPlayback {
        played: AtomicUsize,
        stopped_all: AtomicUsize,
    }

    impl Playback for CountingPlayback {
        fn play(&self, _leg: LegId, _stream: &MediaStream) {
            self.played.fetch_add(1, Ordering::SeqCst);
        }

        fn stop(&self, _leg: LegId) {}

        fn stop_all(&self) {
            self.stopped_all.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FlakyExporter {
        fail: AtomicBool,
        saved: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl RecordingExporter for FlakyExporter {
        async fn export(&self, data: &[u8], suggested_name: &str) -> Result<PathBuf, ExportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ExportError::WriteFailed("disk full".into()));
            }
            self.saved
                .lock()
                .push((suggested_name.to_string(), data.to_vec()));
            Ok(PathBuf::from(suggested_name))
        }
    }

    struct Harness {
        network: LoopbackNetwork,
        engine: CallEngine,
        mic: Arc<SimulatedMicrophone>,
        playback: Arc<CountingPlayback>,
        kv: Arc<MemoryStore>,
        call_log: Arc<CallLogStore>,
        _local: Arc<LoopbackSignaling>,
    }

    async fn harness(policy: RecordingPolicy) -> Harness {
        let network = LoopbackNetwork::new();
        let local = Arc::new(network.client());
        local.open(Some("me".into())).await.unwrap();

        let mic = Arc::new(SimulatedMicrophone::new("mic"));
        let playback = Arc::new(CountingPlayback::default());
        let kv = Arc::new(MemoryStore::new());
        let call_log =
            Arc::new(CallLogStore::open(Arc::clone(&kv) as Arc<dyn KeyValueStore>).unwrap());

        let engine = CallEngine::new(
            Arc::clone(&local) as Arc<dyn SignalingClient>,
            Arc::clone(&mic) as Arc<dyn MediaSource>,
            Arc::clone(&playback) as Arc<dyn Playback>,
            Arc::clone(&call_log),
            policy,
        );
        engine.listen();

        Harness {
            network,
            engine,
            mic,
            playback,
            kv,
            call_log,
            _local: local,
        }
    }

    /// Entfernter Peer, der "me" anruft
    struct Caller {
        _client: LoopbackSignaling,
        handle: Arc<dyn CallHandle>,
        stream: MediaStream,
    }

    async fn ring(h: &Harness, id: &str) -> (Caller, LegId) {
        let client = h.network.client();
        client.open(Some(id.into())).await.unwrap();
        let stream = MediaStream::new(vec![MediaTrack::new(id)]);
        let handle = client.call("me", &stream).unwrap();
        settle().await;

        let leg = h
            .engine
            .pending_calls()
            .into_iter()
            .find(|l| l.peer == id)
            .unwrap()
            .id;
        (
            Caller {
                _client: client,
                handle,
                stream,
            },
            leg,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, CallEvent::TimerTick { .. }) {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_call_held_five_seconds() {
        let h = harness(RecordingPolicy::Manual).await;
        let (caller, leg) = ring(&h, "alice").await;
        assert_eq!(h.mic.acquisitions(), 0);

        assert_eq!(h.engine.accept(leg).await.unwrap(), AcceptOutcome::Answered);
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(h.engine.elapsed(), 5);
        assert_eq!(h.engine.duration_readout(), "00:05");

        caller.handle.close();
        settle().await;

        let snapshot = h.engine.snapshot();
        assert!(snapshot.active.is_empty());
        assert_eq!(snapshot.elapsed_seconds, 0);
        assert!(!snapshot.local_stream_live);
        assert_eq!(h.mic.live_streams(), 0);

        let log = h.call_log.load().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].remote_peer_id, "alice");
        assert_eq!(log[0].duration_seconds, 5);
    }

    #[tokio::test]
    async fn test_accept_answers_with_local_stream() {
        let h = harness(RecordingPolicy::Manual).await;
        let (caller, leg) = ring(&h, "alice").await;
        let mut caller_events = caller.handle.subscribe();

        h.engine.accept(leg).await.unwrap();
        settle().await;

        assert!(matches!(
            caller_events.try_recv().unwrap(),
            LegEvent::Stream(_)
        ));
        // Stream der Gegenseite wird abgespielt
        assert_eq!(h.playback.played.load(Ordering::SeqCst), 1);
        assert!(h.engine.snapshot().local_stream_live);
    }

    #[tokio::test]
    async fn test_two_concurrent_calls() {
        let h = harness(RecordingPolicy::Manual).await;
        let (first, a) = ring(&h, "alice").await;
        h.engine.accept(a).await.unwrap();

        let (second, b) = ring(&h, "bob").await;
        h.engine.accept(b).await.unwrap();
        assert_eq!(h.engine.active_calls().len(), 2);
        assert_eq!(h.mic.acquisitions(), 1);

        first.handle.close();
        settle().await;
        let snapshot = h.engine.snapshot();
        assert_eq!(snapshot.active.len(), 1);
        assert!(snapshot.local_stream_live);
        assert!(h.engine.shared.inner.lock().timer.is_running());

        second.handle.close();
        settle().await;
        let snapshot = h.engine.snapshot();
        assert!(snapshot.active.is_empty());
        assert!(!snapshot.local_stream_live);
        assert!(!h.engine.shared.inner.lock().timer.is_running());
        assert_eq!(h.playback.stopped_all.load(Ordering::SeqCst), 1);

        let log = h.call_log.load().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].remote_peer_id, "bob");
        assert_eq!(log[1].remote_peer_id, "alice");
    }

    #[tokio::test]
    async fn test_double_accept_is_idempotent() {
        let h = harness(RecordingPolicy::Manual).await;
        let (_caller, leg) = ring(&h, "alice").await;
        h.mic.hold();

        let first = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.accept(leg).await }
        });
        settle().await;

        assert_eq!(h.engine.accept(leg).await.unwrap(), AcceptOutcome::InProgress);
        h.mic.release();
        assert_eq!(first.await.unwrap().unwrap(), AcceptOutcome::Answered);
        assert_eq!(h.engine.accept(leg).await.unwrap(), AcceptOutcome::AlreadyActive);

        assert_eq!(h.engine.active_calls().len(), 1);
        assert_eq!(h.mic.acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_withdrawn_during_acquisition_never_activates() {
        let h = harness(RecordingPolicy::Manual).await;
        let (caller, leg) = ring(&h, "alice").await;
        let mut events = h.engine.subscribe();
        h.mic.hold();

        let accepting = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.accept(leg).await }
        });
        settle().await;
        assert_eq!(h.engine.status(leg), Some(LegStatus::Answering));

        caller.handle.close();
        settle().await;
        assert!(h.engine.pending_calls().is_empty());

        h.mic.release();
        assert_eq!(
            accepting.await.unwrap().unwrap(),
            AcceptOutcome::Withdrawn
        );

        assert!(h.engine.active_calls().is_empty());
        assert_eq!(h.mic.live_streams(), 0);
        assert!(h.call_log.entries().is_empty());
        assert_eq!(
            drain(&mut events),
            vec![CallEvent::IncomingWithdrawn { leg }]
        );
    }

    #[tokio::test]
    async fn test_second_call_while_first_accept_pending() {
        let h = harness(RecordingPolicy::Manual).await;
        let (_first, a) = ring(&h, "alice").await;
        h.mic.hold();

        let accepting = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.accept(a).await }
        });
        settle().await;

        let (_second, b) = ring(&h, "bob").await;
        assert_eq!(h.engine.pending_calls().len(), 2);

        h.mic.release();
        accepting.await.unwrap().unwrap();
        assert_eq!(h.engine.status(b), Some(LegStatus::Ringing));
        assert_eq!(h.engine.pending_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_denied_media_leaves_leg_ringing() {
        let h = harness(RecordingPolicy::Manual).await;
        let (_caller, leg) = ring(&h, "alice").await;
        h.mic.set_denied(true);

        let result = h.engine.accept(leg).await;
        assert!(matches!(
            result,
            Err(CallEngineError::MediaUnavailable(MediaError::PermissionDenied))
        ));
        assert_eq!(h.engine.status(leg), Some(LegStatus::Ringing));

        h.mic.set_denied(false);
        assert_eq!(h.engine.accept(leg).await.unwrap(), AcceptOutcome::Answered);
    }

    #[tokio::test]
    async fn test_reject_closes_without_log() {
        let h = harness(RecordingPolicy::Manual).await;
        let (caller, leg) = ring(&h, "alice").await;

        h.engine.reject(leg);
        assert!(caller.handle.is_closed());
        assert!(h.engine.pending_calls().is_empty());
        assert!(h.call_log.entries().is_empty());
        assert_eq!(h.mic.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_dial_and_hangup() {
        let h = harness(RecordingPolicy::Manual).await;
        let bob = h.network.client();
        bob.open(Some("bob".into())).await.unwrap();
        let mut incoming = bob.incoming_calls();

        let leg = h.engine.dial("  bob ").await.unwrap();
        assert_eq!(h.engine.active_calls()[0].direction, Direction::Outgoing);
        assert!(h.engine.shared.inner.lock().timer.is_running());

        let remote = incoming.recv().await.unwrap();
        remote.answer(&MediaStream::new(vec![MediaTrack::new("bob")]));
        settle().await;
        assert_eq!(h.playback.played.load(Ordering::SeqCst), 1);

        h.engine.hangup(leg).unwrap();
        assert!(remote.is_closed());
        assert!(!h.engine.snapshot().local_stream_live);
        assert_eq!(h.call_log.entries()[0].remote_peer_id, "bob");

        // Zweites Auflegen ist ein No-Op
        h.engine.hangup(leg).unwrap();
        assert_eq!(h.call_log.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_creates_no_leg() {
        let h = harness(RecordingPolicy::Manual).await;

        let result = h.engine.dial("ghost").await;
        assert!(matches!(
            result,
            Err(CallEngineError::SignalingFailure(SignalingError::PeerUnavailable(_)))
        ));
        assert!(h.engine.active_calls().is_empty());
        assert_eq!(h.mic.live_streams(), 0);
        assert!(!h.engine.shared.inner.lock().timer.is_running());
    }

    #[tokio::test]
    async fn test_dial_many_parses_list() {
        let h = harness(RecordingPolicy::Manual).await;
        let mut clients = Vec::new();
        for id in ["a", "b"] {
            let client = h.network.client();
            client.open(Some(id.into())).await.unwrap();
            clients.push(client);
        }

        let results = h.engine.dial_many(" a, ,b ,ghost,").await;
        let peers: Vec<&str> = results.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(peers, vec!["a", "b", "ghost"]);
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_ok());
        assert!(results[2].1.is_err());

        assert_eq!(h.engine.active_calls().len(), 2);
        assert_eq!(h.mic.live_streams(), 1);
    }

    #[tokio::test]
    async fn test_end_all_logs_every_leg() {
        let h = harness(RecordingPolicy::Manual).await;
        let mut callers = Vec::new();
        for id in ["a", "b", "c"] {
            let (caller, leg) = ring(&h, id).await;
            h.engine.accept(leg).await.unwrap();
            callers.push(caller);
        }

        h.engine.end_all().unwrap();
        assert!(callers.iter().all(|c| c.handle.is_closed()));
        assert_eq!(h.call_log.entries().len(), 3);
        assert!(!h.engine.snapshot().local_stream_live);
        assert_eq!(h.engine.elapsed(), 0);
    }

    #[tokio::test]
    async fn test_recording_start_twice() {
        let h = harness(RecordingPolicy::Manual).await;
        assert!(matches!(
            h.engine.start_recording(),
            Err(CallEngineError::NoActiveCall)
        ));

        let (caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();
        settle().await;

        assert_eq!(h.engine.start_recording().unwrap(), 2);
        caller.stream.tracks()[0].push(vec![1, 2, 3]);

        assert!(matches!(
            h.engine.start_recording(),
            Err(CallEngineError::Recorder(RecorderError::AlreadyRecording))
        ));

        let recording = h.engine.stop_recording().unwrap();
        assert_eq!(recording.data, vec![1, 2, 3]);
        assert!(matches!(
            h.engine.stop_recording(),
            Err(CallEngineError::Recorder(RecorderError::NotRecording))
        ));
    }

    #[tokio::test]
    async fn test_last_call_end_flushes_recording_before_release() {
        let h = harness(RecordingPolicy::Manual).await;
        let (caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();
        settle().await;

        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![9, 9]);
        let mut events = h.engine.subscribe();

        caller.handle.close();
        settle().await;

        assert!(!h.engine.is_recording());
        assert_eq!(h.engine.pending_export().unwrap().data, vec![9, 9]);

        let events = drain(&mut events);
        let stopped = events
            .iter()
            .position(|e| *e == CallEvent::RecordingStopped { bytes: 2 })
            .unwrap();
        let ended = events
            .iter()
            .position(|e| *e == CallEvent::AllCallsEnded)
            .unwrap();
        assert!(stopped < ended);
        assert_eq!(h.mic.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_auto_policy_records_on_remote_stream() {
        let h = harness(RecordingPolicy::Auto).await;
        let mut events = h.engine.subscribe();
        let (_caller, leg) = ring(&h, "alice").await;

        h.engine.accept(leg).await.unwrap();
        settle().await;

        assert!(h.engine.is_recording());
        assert!(drain(&mut events).contains(&CallEvent::RecordingStarted { tracks: 2 }));
    }

    #[tokio::test]
    async fn test_failed_export_keeps_recording() {
        let h = harness(RecordingPolicy::Manual).await;
        let exporter = FlakyExporter::default();
        assert!(matches!(
            h.engine.export_recording(&exporter).await,
            Err(CallEngineError::NothingToExport)
        ));

        let (caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();
        settle().await;
        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![5]);
        h.engine.stop_recording().unwrap();

        exporter.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            h.engine.export_recording(&exporter).await,
            Err(CallEngineError::Export(ExportError::WriteFailed(_)))
        ));
        assert!(h.engine.pending_export().is_some());

        exporter.fail.store(false, Ordering::SeqCst);
        let path = h.engine.export_recording(&exporter).await.unwrap();
        assert!(path.to_string_lossy().starts_with("call-recording-"));
        assert_eq!(exporter.saved.lock()[0].1, vec![5]);
        assert!(h.engine.pending_export().is_none());
    }

    #[tokio::test]
    async fn test_failed_export_survives_next_recording() {
        let h = harness(RecordingPolicy::Manual).await;
        let exporter = FlakyExporter::default();
        let (caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();
        settle().await;

        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![1, 1, 1]);
        h.engine.stop_recording().unwrap();

        exporter.fail.store(true, Ordering::SeqCst);
        assert!(h.engine.export_recording(&exporter).await.is_err());

        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![2]);
        h.engine.stop_recording().unwrap();

        let pending: Vec<Vec<u8>> = h
            .engine
            .pending_exports()
            .into_iter()
            .map(|r| r.data)
            .collect();
        assert_eq!(pending, vec![vec![1, 1, 1], vec![2]]);

        exporter.fail.store(false, Ordering::SeqCst);
        h.engine.export_recording(&exporter).await.unwrap();
        h.engine.export_recording(&exporter).await.unwrap();

        let saved: Vec<Vec<u8>> = exporter.saved.lock().iter().map(|(_, d)| d.clone()).collect();
        assert_eq!(saved, vec![vec![1, 1, 1], vec![2]]);
        assert!(h.engine.pending_exports().is_empty());
    }

    #[tokio::test]
    async fn test_export_by_id_leaves_older_recordings() {
        let h = harness(RecordingPolicy::Manual).await;
        let exporter = FlakyExporter::default();
        let (caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();
        settle().await;

        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![1]);
        let older = h.engine.stop_recording().unwrap();

        h.engine.start_recording().unwrap();
        caller.stream.tracks()[0].push(vec![2]);
        let newer = h.engine.stop_recording().unwrap();

        h.engine
            .export_recording_id(&exporter, newer.id)
            .await
            .unwrap();
        assert_eq!(exporter.saved.lock()[0].1, vec![2]);
        assert_eq!(h.engine.pending_export().unwrap().id, older.id);

        assert!(matches!(
            h.engine.export_recording_id(&exporter, newer.id).await,
            Err(CallEngineError::NothingToExport)
        ));
    }

    #[tokio::test]
    async fn test_auto_policy_respects_manual_stop() {
        let h = harness(RecordingPolicy::Auto).await;
        let (_first, a) = ring(&h, "alice").await;
        h.engine.accept(a).await.unwrap();
        settle().await;
        assert!(h.engine.is_recording());

        h.engine.stop_recording().unwrap();

        let (_second, b) = ring(&h, "bob").await;
        h.engine.accept(b).await.unwrap();
        settle().await;

        assert_eq!(h.engine.active_calls().len(), 2);
        assert!(!h.engine.is_recording());
        assert_eq!(h.engine.pending_exports().len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_state_consistent() {
        let h = harness(RecordingPolicy::Manual).await;
        let (_caller, leg) = ring(&h, "alice").await;
        h.engine.accept(leg).await.unwrap();

        h.kv.set_fail_writes(true);
        assert!(matches!(
            h.engine.hangup(leg),
            Err(CallEngineError::PersistenceFailure(_))
        ));
        assert!(h.engine.active_calls().is_empty());
        assert!(!h.engine.snapshot().local_stream_live);
        assert!(h.call_log.has_unsaved_entries());

        h.kv.set_fail_writes(false);
        h.call_log.flush().unwrap();
        assert_eq!(h.call_log.load().unwrap().len(), 1);
    }
}

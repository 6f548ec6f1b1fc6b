//! Session State - reiner Reducer der Anruf-Zustandsmaschine
//!
//! Jeder Übergang ist eine Funktion `(State, Event) -> (State, Effects)`.
//! Effekte (Media holen, Timer starten, Log schreiben, ...) führt die
//! `CallEngine` aus. Jeder Übergang prüft seine Vorbedingung gegen den
//! aktuellen Zustand, nie gegen einen vorher gemerkten Snapshot.

use super::engine::CallEvent;
use crate::storage::CallLogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// IDENTIFIERS & POLICIES
// ============================================================================

/// Lokale ID eines Anruf-Legs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LegId(Uuid);

impl LegId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LegId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Wann eine Aufnahme startet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingPolicy {
    /// Nur auf expliziten Befehl
    #[default]
    Manual,
    /// Automatisch sobald der erste entfernte Stream eintrifft
    Auto,
}

impl std::str::FromStr for RecordingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(format!("Unknown recording policy '{}'", other)),
        }
    }
}

/// Status eines bekannten Legs. Beendete Legs werden entfernt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStatus {
    /// Eingehend, wartet auf Annahme
    Ringing,
    /// Annahme läuft, Mikrofon wird noch geholt
    Answering,
    /// Verbunden
    Active,
}

/// Anzeige-Daten eines Legs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegSummary {
    pub id: LegId,
    pub peer: String,
    pub direction: Direction,
}

/// Wofür Media geholt wird
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Accept(LegId),
    Dial { peer: String },
}

// ============================================================================
// EVENTS & EFFECTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum SessionEvent {
    IncomingCall { leg: LegId, peer: String },
    AcceptRequested { leg: LegId, at: Instant },
    RejectRequested { leg: LegId },
    DialRequested { peer: String },
    MediaAcquired { intent: Intent, at: Instant },
    MediaFailed { intent: Intent },
    DialEstablished { leg: LegId, peer: String, at: Instant },
    DialFailed { peer: String },
    RemoteStream { leg: LegId },
    LegClosed { leg: LegId, at: Instant, ended_at: DateTime<Utc> },
    HangupRequested { leg: LegId, at: Instant, ended_at: DateTime<Utc> },
    EndAllRequested { at: Instant, ended_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Mikrofon asynchron holen, Ergebnis kommt als `MediaAcquired`/`MediaFailed`
    AcquireMedia(Intent),
    /// Gerade geholten Stream als LocalStream übernehmen
    AdoptStream,
    /// Gerade geholten Stream stoppen und verwerfen
    DiscardStream,
    PlaceCall { peer: String },
    Answer(LegId),
    CloseLeg(LegId),
    /// Handle, Event-Watcher und Remote-Stream des Legs freigeben
    Forget(LegId),
    StoreRemoteStream(LegId),
    Play(LegId),
    StartTimer,
    StopTimer,
    AttachToRecording(LegId),
    AutoRecord,
    FlushRecording,
    ReleaseLocalStream,
    TeardownPlayback,
    AppendLog(CallLogEntry),
    Emit(CallEvent),
}

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone)]
struct Leg {
    peer: String,
    direction: Direction,
    status: LegStatus,
    started_at: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    legs: HashMap<LegId, Leg>,
    pending: Vec<LegId>,
    active: Vec<LegId>,
    local_stream: bool,
    timer_running: bool,
    /// Automatische Aufnahme wurde in diesem Anruf-Fenster schon ausgelöst
    auto_recorded: bool,
    policy: RecordingPolicy,
}

impl SessionState {
    pub fn new(policy: RecordingPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn status(&self, leg: LegId) -> Option<LegStatus> {
        self.legs.get(&leg).map(|l| l.status)
    }

    pub fn pending(&self) -> Vec<LegSummary> {
        self.pending.iter().filter_map(|id| self.summary(*id)).collect()
    }

    pub fn active(&self) -> Vec<LegSummary> {
        self.active.iter().filter_map(|id| self.summary(*id)).collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_local_stream(&self) -> bool {
        self.local_stream
    }

    pub fn timer_running(&self) -> bool {
        self.timer_running
    }

    pub fn policy(&self) -> RecordingPolicy {
        self.policy
    }

    /// `|Active| == 0 ⇔ Timer gestoppt ⇔ LocalStream freigegeben`, und
    /// kein Leg ist gleichzeitig wartend und aktiv
    pub fn invariants_hold(&self) -> bool {
        let idle = self.active.is_empty();
        idle == !self.timer_running
            && idle == !self.local_stream
            && self.pending.iter().all(|id| !self.active.contains(id))
    }

    fn summary(&self, id: LegId) -> Option<LegSummary> {
        self.legs.get(&id).map(|leg| LegSummary {
            id,
            peer: leg.peer.clone(),
            direction: leg.direction,
        })
    }

    // ========================================================================
    // REDUCER
    // ========================================================================

    pub fn apply(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::IncomingCall { leg, peer } => {
                if self.legs.contains_key(&leg) {
                    return Vec::new();
                }
                self.legs.insert(
                    leg,
                    Leg {
                        peer: peer.clone(),
                        direction: Direction::Incoming,
                        status: LegStatus::Ringing,
                        started_at: None,
                    },
                );
                self.pending.push(leg);
                vec![Effect::Emit(CallEvent::IncomingCall { leg, peer })]
            }

            SessionEvent::AcceptRequested { leg, at } => {
                if self.status(leg) != Some(LegStatus::Ringing) {
                    return Vec::new();
                }
                if self.local_stream {
                    return self.activate(leg, at);
                }
                self.set_status(leg, LegStatus::Answering);
                vec![Effect::AcquireMedia(Intent::Accept(leg))]
            }

            SessionEvent::RejectRequested { leg } => match self.status(leg) {
                Some(LegStatus::Ringing) | Some(LegStatus::Answering) => {
                    let mut effects = vec![Effect::CloseLeg(leg)];
                    effects.extend(self.drop_pending(leg, CallEvent::IncomingRejected { leg }));
                    effects
                }
                _ => Vec::new(),
            },

            SessionEvent::DialRequested { peer } => {
                if self.local_stream {
                    vec![Effect::PlaceCall { peer }]
                } else {
                    vec![Effect::AcquireMedia(Intent::Dial { peer })]
                }
            }

            SessionEvent::MediaAcquired { intent, at } => match intent {
                Intent::Accept(leg) => match self.status(leg) {
                    Some(LegStatus::Ringing) | Some(LegStatus::Answering) => {
                        let mut effects = vec![self.take_acquired_stream()];
                        effects.extend(self.activate(leg, at));
                        effects
                    }
                    // Leg wurde inzwischen beendet oder schon angenommen
                    _ => vec![Effect::DiscardStream],
                },
                Intent::Dial { peer } => {
                    vec![self.take_acquired_stream(), Effect::PlaceCall { peer }]
                }
            },

            SessionEvent::MediaFailed { intent } => {
                if let Intent::Accept(leg) = intent {
                    if self.status(leg) == Some(LegStatus::Answering) {
                        self.set_status(leg, LegStatus::Ringing);
                    }
                }
                Vec::new()
            }

            SessionEvent::DialEstablished { leg, peer, at } => {
                self.legs.insert(
                    leg,
                    Leg {
                        peer,
                        direction: Direction::Outgoing,
                        status: LegStatus::Ringing,
                        started_at: None,
                    },
                );
                self.activate(leg, at)
            }

            SessionEvent::DialFailed { .. } => {
                // Frisch geholter Stream ohne aktives Leg wird sofort freigegeben
                if self.active.is_empty() && self.local_stream {
                    self.local_stream = false;
                    vec![Effect::ReleaseLocalStream]
                } else {
                    Vec::new()
                }
            }

            SessionEvent::RemoteStream { leg } => {
                if self.status(leg) != Some(LegStatus::Active) {
                    return Vec::new();
                }
                let mut effects = vec![
                    Effect::StoreRemoteStream(leg),
                    Effect::Play(leg),
                    Effect::AttachToRecording(leg),
                ];
                if self.policy == RecordingPolicy::Auto && !self.auto_recorded {
                    self.auto_recorded = true;
                    effects.push(Effect::AutoRecord);
                }
                effects.push(Effect::Emit(CallEvent::RemoteStream { leg }));
                effects
            }

            SessionEvent::LegClosed { leg, at, ended_at } => self.end_leg(leg, at, ended_at),

            SessionEvent::HangupRequested { leg, at, ended_at } => match self.status(leg) {
                Some(LegStatus::Active) => {
                    let mut effects = vec![Effect::CloseLeg(leg)];
                    effects.extend(self.end_leg(leg, at, ended_at));
                    effects
                }
                Some(_) => self.apply(SessionEvent::RejectRequested { leg }),
                None => Vec::new(),
            },

            SessionEvent::EndAllRequested { at, ended_at } => {
                let mut effects = Vec::new();
                for leg in self.active.clone() {
                    effects.push(Effect::CloseLeg(leg));
                    effects.extend(self.end_leg(leg, at, ended_at));
                }
                effects
            }
        }
    }

    // ========================================================================
    // TRANSITION HELPERS
    // ========================================================================

    fn set_status(&mut self, leg: LegId, status: LegStatus) {
        if let Some(l) = self.legs.get_mut(&leg) {
            l.status = status;
        }
    }

    /// Übernimmt den geholten Stream, oder verwirft ihn wenn bereits
    /// ein LocalStream existiert
    fn take_acquired_stream(&mut self) -> Effect {
        if self.local_stream {
            Effect::DiscardStream
        } else {
            self.local_stream = true;
            Effect::AdoptStream
        }
    }

    /// Ringing/Answering (oder frisch gewähltes Leg) → Active
    fn activate(&mut self, leg: LegId, at: Instant) -> Vec<Effect> {
        let Some(entry) = self.legs.get_mut(&leg) else {
            return Vec::new();
        };
        entry.status = LegStatus::Active;
        entry.started_at = Some(at);
        let peer = entry.peer.clone();
        let direction = entry.direction;

        self.pending.retain(|id| *id != leg);
        let was_idle = self.active.is_empty();
        self.active.push(leg);

        let mut effects = Vec::new();
        if direction == Direction::Incoming {
            effects.push(Effect::Answer(leg));
        }
        if was_idle && !self.timer_running {
            self.timer_running = true;
            effects.push(Effect::StartTimer);
        }
        effects.push(Effect::Emit(CallEvent::CallStarted {
            leg,
            peer,
            direction,
        }));
        effects
    }

    fn drop_pending(&mut self, leg: LegId, event: CallEvent) -> Vec<Effect> {
        self.pending.retain(|id| *id != leg);
        self.legs.remove(&leg);
        vec![Effect::Forget(leg), Effect::Emit(event)]
    }

    fn end_leg(&mut self, leg: LegId, at: Instant, ended_at: DateTime<Utc>) -> Vec<Effect> {
        let Some(status) = self.status(leg) else {
            return Vec::new();
        };
        if status != LegStatus::Active {
            // Gegenseite hat vor der Annahme aufgelegt
            return self.drop_pending(leg, CallEvent::IncomingWithdrawn { leg });
        }

        let Some(ended) = self.legs.remove(&leg) else {
            return Vec::new();
        };
        self.active.retain(|id| *id != leg);

        let duration_seconds = ended
            .started_at
            .map(|start| at.saturating_duration_since(start).as_secs())
            .unwrap_or(0);
        let entry = CallLogEntry {
            remote_peer_id: ended.peer,
            duration_seconds,
            ended_at,
        };

        let mut effects = vec![
            Effect::Forget(leg),
            Effect::AppendLog(entry.clone()),
            Effect::Emit(CallEvent::CallEnded { leg, entry }),
        ];
        if self.active.is_empty() {
            effects.extend(self.teardown());
        }
        effects
    }

    /// Einziger Freigabepfad: Aufnahme flushen, dann Timer, LocalStream
    /// und Wiedergabe abbauen
    fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::FlushRecording];
        self.auto_recorded = false;
        if self.timer_running {
            self.timer_running = false;
            effects.push(Effect::StopTimer);
        }
        if self.local_stream {
            self.local_stream = false;
            effects.push(Effect::ReleaseLocalStream);
        }
        effects.push(Effect::TeardownPlayback);
        effects.push(Effect::Emit(CallEvent::AllCallsEnded));
        effects
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Call Engine Module - Anruf-Sessions
//!
//! Dieses Modul verwaltet:
//! - Zustandsmaschine aller Anruf-Legs (wartend, aktiv, beendet)
//! - Gemeinsamen LocalStream und Anruf-Timer
//! - Aufnahme über alle Tracks der laufenden Anrufe
//! - Anrufprotokoll beim Beenden eines Legs

mod engine;
mod recorder;
mod state;
mod timer;

pub use engine::{AcceptOutcome, CallEngine, CallEngineError, CallEvent, SessionSnapshot};
pub use recorder::{Recorder, RecorderError, Recording};
pub use state::{Direction, LegId, LegStatus, LegSummary, RecordingPolicy};
pub use timer::{format_duration, CallTimer};

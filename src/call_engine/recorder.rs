//! Recorder - nimmt alle Tracks einer Session in einen Puffer auf
//!
//! Alle Tracks (lokal und entfernt) liefern in denselben Kanal; die
//! Chunks landen in Ankunftsreihenfolge im Puffer und werden beim
//! Stoppen zu einem zusammenhängenden Blob.

use crate::media::{AudioChunk, MediaStream};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    #[error("A recording is already running")]
    AlreadyRecording,

    #[error("No recording is running")]
    NotRecording,
}

// ============================================================================
// RECORDING
// ============================================================================

/// Abgeschlossene Aufnahme, bereit zum Export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub id: Uuid,
    pub data: Vec<u8>,
    pub chunk_count: usize,
    pub track_count: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Recording {
    /// Dateiname-Vorschlag für den Export (UTC-Zeit beim Stoppen)
    pub fn suggested_filename(&self) -> String {
        format!(
            "call-recording-{}.pcm",
            self.finished_at.format("%Y%m%d-%H%M%S")
        )
    }
}

struct RecordingSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    tracks: HashSet<Uuid>,
    tx: mpsc::UnboundedSender<AudioChunk>,
    rx: mpsc::UnboundedReceiver<AudioChunk>,
    buffer: Vec<u8>,
    chunk_count: usize,
}

impl RecordingSession {
    /// Holt alle bisher eingetroffenen Chunks in den Puffer
    fn drain(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.buffer.extend_from_slice(&chunk.data);
            self.chunk_count += 1;
        }
    }
}

// ============================================================================
// RECORDER
// ============================================================================

#[derive(Default)]
pub struct Recorder {
    session: Option<RecordingSession>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet eine neue Aufnahme über alle Tracks der Streams.
    /// Gibt die Anzahl aufgenommener Tracks zurück.
    pub fn start(&mut self, streams: &[MediaStream]) -> Result<usize, RecorderError> {
        if self.session.is_some() {
            return Err(RecorderError::AlreadyRecording);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = RecordingSession {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            tracks: HashSet::new(),
            tx,
            rx,
            buffer: Vec::new(),
            chunk_count: 0,
        };
        for stream in streams {
            attach_stream(&mut session, stream);
        }

        let tracks = session.tracks.len();
        tracing::info!("Recording {} started with {} track(s)", session.id, tracks);
        self.session = Some(session);
        Ok(tracks)
    }

    /// Nimmt einen weiteren Stream in die laufende Aufnahme auf.
    /// Ohne laufende Aufnahme ein No-Op.
    pub fn attach(&mut self, stream: &MediaStream) -> usize {
        match self.session.as_mut() {
            Some(session) => attach_stream(session, stream),
            None => 0,
        }
    }

    /// Beendet die Aufnahme und liefert den Blob
    pub fn stop(&mut self) -> Result<Recording, RecorderError> {
        let mut session = self.session.take().ok_or(RecorderError::NotRecording)?;
        session.drain();

        let recording = Recording {
            id: session.id,
            data: session.buffer,
            chunk_count: session.chunk_count,
            track_count: session.tracks.len(),
            started_at: session.started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            "Recording {} stopped: {} bytes from {} chunk(s)",
            recording.id,
            recording.data.len(),
            recording.chunk_count
        );
        Ok(recording)
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    /// Bisher gepufferte Bytes der laufenden Aufnahme
    pub fn buffered_len(&mut self) -> usize {
        match self.session.as_mut() {
            Some(session) => {
                session.drain();
                session.buffer.len()
            }
            None => 0,
        }
    }
}

fn attach_stream(session: &mut RecordingSession, stream: &MediaStream) -> usize {
    let mut attached = 0;
    for track in stream.tracks() {
        if session.tracks.contains(&track.id()) {
            continue;
        }
        if track.attach_sink(session.tx.clone()) {
            session.tracks.insert(track.id());
            attached += 1;
        }
    }
    attached
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("recording", &self.session.as_ref().map(|s| s.id))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;

    fn stream(label: &str) -> MediaStream {
        MediaStream::new(vec![MediaTrack::new(label)])
    }

    #[test]
    fn test_records_chunks_in_arrival_order() {
        let local = stream("local");
        let remote = stream("remote");
        let mut recorder = Recorder::new();
        assert_eq!(recorder.start(&[local.clone(), remote.clone()]).unwrap(), 2);

        local.tracks()[0].push(vec![1, 2]);
        remote.tracks()[0].push(vec![3]);
        local.tracks()[0].push(vec![4]);

        let recording = recorder.stop().unwrap();
        assert_eq!(recording.data, vec![1, 2, 3, 4]);
        assert_eq!(recording.chunk_count, 3);
        assert_eq!(recording.track_count, 2);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_start_twice_keeps_first_session() {
        let local = stream("local");
        let mut recorder = Recorder::new();
        recorder.start(&[local.clone()]).unwrap();
        local.tracks()[0].push(vec![7, 7]);

        assert_eq!(
            recorder.start(&[local.clone()]),
            Err(RecorderError::AlreadyRecording)
        );
        assert_eq!(recorder.buffered_len(), 2);
        assert_eq!(recorder.stop().unwrap().data, vec![7, 7]);
    }

    #[test]
    fn test_stop_without_session() {
        let mut recorder = Recorder::new();
        assert_eq!(recorder.stop(), Err(RecorderError::NotRecording));
    }

    #[test]
    fn test_attach_skips_known_tracks() {
        let local = stream("local");
        let mut recorder = Recorder::new();
        assert_eq!(recorder.attach(&local), 0);

        recorder.start(&[local.clone()]).unwrap();
        assert_eq!(recorder.attach(&local), 0);
        assert_eq!(recorder.attach(&stream("late")), 1);
    }

    #[test]
    fn test_suggested_filename() {
        let mut recorder = Recorder::new();
        recorder.start(&[]).unwrap();
        let name = recorder.stop().unwrap().suggested_filename();
        assert!(name.starts_with("call-recording-"));
        assert!(name.ends_with(".pcm"));
        assert_eq!(name.len(), "call-recording-20240101-120000.pcm".len());
    }
}

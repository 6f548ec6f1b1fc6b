//! Media Streams und Tracks
//!
//! Ein Track verteilt kodierte Audio-Chunks an alle angehängten Sinks,
//! bis er gestoppt wird. Streams sind billig klonbar und teilen sich
//! ihre Tracks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Ein kodierter Audio-Block eines Tracks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub track_id: Uuid,
    pub sequence: u64,
    pub data: Vec<u8>,
}

// ============================================================================
// TRACK
// ============================================================================

struct TrackInner {
    id: Uuid,
    label: String,
    stopped: AtomicBool,
    sequence: AtomicU64,
    sinks: Mutex<Vec<mpsc::UnboundedSender<AudioChunk>>>,
}

/// Einzelner Audio-Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                label: label.into(),
                stopped: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
                sinks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Stoppt den Track; alle Sinks werden getrennt
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.sinks.lock().clear();
            tracing::debug!("Track {} ({}) stopped", self.inner.id, self.inner.label);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Verteilt einen Chunk an alle Sinks. Gibt `false` zurück wenn der
    /// Track bereits gestoppt ist.
    pub fn push(&self, data: Vec<u8>) -> bool {
        if self.is_stopped() {
            return false;
        }

        let chunk = AudioChunk {
            track_id: self.inner.id,
            sequence: self.inner.sequence.fetch_add(1, Ordering::SeqCst),
            data,
        };

        // Geschlossene Sinks fallen dabei raus
        self.inner
            .sinks
            .lock()
            .retain(|sink| sink.send(chunk.clone()).is_ok());
        true
    }

    /// Hängt einen Sink an; auf gestoppten Tracks ein No-Op
    pub fn attach_sink(&self, sink: mpsc::UnboundedSender<AudioChunk>) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.inner.sinks.lock().push(sink);
        true
    }

    pub fn sink_count(&self) -> usize {
        self.inner.sinks.lock().len()
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// STREAM
// ============================================================================

/// Sammlung von Tracks einer Quelle
#[derive(Clone)]
pub struct MediaStream {
    id: Uuid,
    tracks: Arc<Vec<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks: Arc::new(tracks),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Stoppt alle Tracks des Streams
    pub fn stop(&self) {
        for track in self.tracks.iter() {
            track.stop();
        }
    }

    /// `true` solange mindestens ein Track läuft
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_stopped())
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_reaches_all_sinks() {
        let track = MediaTrack::new("mic");
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        track.attach_sink(tx_a);
        track.attach_sink(tx_b);

        assert!(track.push(vec![1, 2]));
        assert_eq!(rx_a.try_recv().unwrap().data, vec![1, 2]);
        assert_eq!(rx_b.try_recv().unwrap().sequence, 0);
    }

    #[test]
    fn test_dropped_sink_is_pruned() {
        let track = MediaTrack::new("mic");
        let (tx, rx) = mpsc::unbounded_channel();
        track.attach_sink(tx);
        drop(rx);

        track.push(vec![0]);
        assert_eq!(track.sink_count(), 0);
    }

    #[test]
    fn test_stop_detaches_sinks() {
        let stream = MediaStream::new(vec![MediaTrack::new("a"), MediaTrack::new("b")]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        stream.tracks()[0].attach_sink(tx);
        assert!(stream.is_live());

        stream.stop();
        assert!(!stream.is_live());
        assert!(!stream.tracks()[0].push(vec![9]));
        assert!(rx.try_recv().is_err());

        let (late, _rx) = mpsc::unbounded_channel();
        assert!(!stream.tracks()[1].attach_sink(late));
    }
}

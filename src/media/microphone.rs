//! Simuliertes Mikrofon
//!
//! Liefert Streams mit einem Track, der optional einen Sinuston als
//! 16-bit PCM in 20ms Frames erzeugt. Akquise kann verweigert oder
//! angehalten werden, um Berechtigungsdialoge nachzustellen.

use super::{MediaError, MediaSource, MediaStream, MediaTrack};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

const FRAME_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// MICROPHONE
// ============================================================================

pub struct SimulatedMicrophone {
    label: String,
    tone_hz: Option<f32>,
    denied: AtomicBool,
    /// `true` solange Akquisen warten müssen
    held: watch::Sender<bool>,
    acquisitions: AtomicUsize,
    /// Ausgegebene Streams; gestoppte werden beim nächsten Zugriff entfernt
    issued: Mutex<Vec<MediaStream>>,
}

impl SimulatedMicrophone {
    /// Mikrofon, dessen Tracks keine eigenen Frames erzeugen
    pub fn new(label: impl Into<String>) -> Self {
        let (held, _) = watch::channel(false);
        Self {
            label: label.into(),
            tone_hz: None,
            denied: AtomicBool::new(false),
            held,
            acquisitions: AtomicUsize::new(0),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Tracks erzeugen einen Sinuston mit `frequency_hz`
    pub fn with_tone(mut self, frequency_hz: f32) -> Self {
        self.tone_hz = Some(frequency_hz);
        self
    }

    /// Simuliert verweigerte Mikrofon-Berechtigung
    pub fn set_denied(&self, denied: bool) {
        self.denied.store(denied, Ordering::SeqCst);
    }

    /// Hält alle folgenden Akquisen an, bis `release` aufgerufen wird
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Anzahl erfolgreicher Akquisen
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Anzahl ausgegebener Streams, die noch laufen
    pub fn live_streams(&self) -> usize {
        let mut issued = self.issued.lock();
        issued.retain(|s| s.is_live());
        issued.len()
    }

    fn spawn_generator(track: MediaTrack, frequency_hz: f32) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_INTERVAL);
            let mut phase = 0usize;
            loop {
                interval.tick().await;
                if !track.push(tone_frame(frequency_hz, phase)) {
                    break;
                }
                phase += FRAME_SIZE;
            }
            tracing::debug!("Tone generator for track {} finished", track.id());
        });
    }
}

#[async_trait]
impl MediaSource for SimulatedMicrophone {
    async fn acquire_audio(&self) -> Result<MediaStream, MediaError> {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        if self.denied.load(Ordering::SeqCst) {
            tracing::warn!("Microphone access denied ({})", self.label);
            return Err(MediaError::PermissionDenied);
        }

        let track = MediaTrack::new(self.label.clone());
        if let Some(frequency_hz) = self.tone_hz {
            Self::spawn_generator(track.clone(), frequency_hz);
        }

        let stream = MediaStream::new(vec![track]);
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        {
            let mut issued = self.issued.lock();
            issued.retain(|s| s.is_live());
            issued.push(stream.clone());
        }

        tracing::info!(
            "Microphone stream {} acquired: {}Hz, {} channel(s)",
            stream.id(),
            SAMPLE_RATE,
            CHANNELS
        );
        Ok(stream)
    }
}

impl std::fmt::Debug for SimulatedMicrophone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedMicrophone")
            .field("label", &self.label)
            .field("acquisitions", &self.acquisitions())
            .field("live_streams", &self.live_streams())
            .finish()
    }
}

/// Erzeugt einen Frame Sinuston als 16-bit little-endian PCM
fn tone_frame(frequency_hz: f32, start_sample: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(FRAME_SIZE * 2);
    for i in 0..FRAME_SIZE {
        let t = (start_sample + i) as f32 / SAMPLE_RATE as f32;
        let sample = (t * frequency_hz * std::f32::consts::TAU).sin() * 0.25;
        let value = (sample * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

// ============================================================================
// TESTS
// ============================================================================

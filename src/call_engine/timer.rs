//! Anruf-Timer
//!
//! Ein gemeinsamer Sekundenzähler für die gesamte Session. Läuft ab dem
//! ersten aktiven Leg und wird mit dem letzten beendeten Leg gestoppt
//! und zurückgesetzt.

use super::engine::CallEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct CallTimer {
    elapsed: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl CallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startet den Timer bei 0; ein bereits laufender Timer bleibt unverändert
    pub fn start(&mut self, event_tx: broadcast::Sender<CallEvent>) {
        if self.is_running() {
            return;
        }
        self.elapsed.store(0, Ordering::SeqCst);

        let elapsed = Arc::clone(&self.elapsed);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let seconds = elapsed.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::trace!("Call timer tick: {}", format_duration(seconds));
                let _ = event_tx.send(CallEvent::TimerTick { elapsed: seconds });
            }
        }));
        tracing::debug!("Call timer started");
    }

    /// Stoppt den Timer und setzt die Anzeige auf 0 zurück
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(
                "Call timer stopped at {}",
                format_duration(self.elapsed())
            );
        }
        self.elapsed.store(0, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed.load(Ordering::SeqCst)
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Formatiert Sekunden als `MM:SS`; Minuten laufen über 59 hinaus weiter
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

// ============================================================================
// TESTS
// ============================================================================

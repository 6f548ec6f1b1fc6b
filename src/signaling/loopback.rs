//! In-Process Signaling
//!
//! Verbindet Clients desselben `LoopbackNetwork` direkt miteinander.
//! Jeder Anruf besteht aus zwei Enden (Caller und Callee), die sich
//! einen gemeinsamen Link teilen.

use super::{CallHandle, LegEvent, SignalingClient, SignalingError};
use crate::media::MediaStream;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

type Registry = Arc<Mutex<HashMap<String, broadcast::Sender<Arc<dyn CallHandle>>>>>;

// ============================================================================
// NETWORK
// ============================================================================

/// Gemeinsamer Verzeichnisdienst aller Loopback-Clients
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    peers: Registry,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Erstellt einen neuen, noch nicht geöffneten Client
    pub fn client(&self) -> LoopbackSignaling {
        let (incoming_tx, _) = broadcast::channel(100);
        LoopbackSignaling {
            peers: Arc::clone(&self.peers),
            id: RwLock::new(None),
            incoming_tx,
        }
    }

    /// Prüft ob eine ID registriert ist
    pub fn is_registered(&self, id: &str) -> bool {
        self.peers.lock().contains_key(id)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("peers", &self.peers.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct LoopbackSignaling {
    peers: Registry,
    id: RwLock<Option<String>>,
    incoming_tx: broadcast::Sender<Arc<dyn CallHandle>>,
}

impl LoopbackSignaling {
    /// Gibt die aktuelle ID zurück (falls geöffnet)
    pub fn id(&self) -> Option<String> {
        self.id.read().clone()
    }
}

#[async_trait]
impl SignalingClient for LoopbackSignaling {
    async fn open(&self, saved_id: Option<String>) -> Result<String, SignalingError> {
        if let Some(id) = self.id() {
            return Ok(id);
        }

        let id = saved_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&id) {
                return Err(SignalingError::IdUnavailable(id));
            }
            peers.insert(id.clone(), self.incoming_tx.clone());
        }

        *self.id.write() = Some(id.clone());
        tracing::info!("Loopback session open as {}", id);
        Ok(id)
    }

    fn incoming_calls(&self) -> broadcast::Receiver<Arc<dyn CallHandle>> {
        self.incoming_tx.subscribe()
    }

    fn call(
        &self,
        remote_id: &str,
        local_stream: &MediaStream,
    ) -> Result<Arc<dyn CallHandle>, SignalingError> {
        let own_id = self.id().ok_or(SignalingError::NotOpen)?;
        if remote_id == own_id {
            return Err(SignalingError::PeerUnavailable(remote_id.to_string()));
        }

        let remote_tx = self
            .peers
            .lock()
            .get(remote_id)
            .cloned()
            .ok_or_else(|| SignalingError::PeerUnavailable(remote_id.to_string()))?;

        // Empfänger vorab anlegen, damit frühe Events nicht verloren gehen
        let (caller_events, caller_rx) = broadcast::channel(16);
        let (callee_events, callee_rx) = broadcast::channel(16);
        let link = Arc::new(Link {
            caller_stream: local_stream.clone(),
            closed: AtomicBool::new(false),
            answered: AtomicBool::new(false),
            caller_events,
            callee_events,
        });

        let callee: Arc<dyn CallHandle> = Arc::new(LoopbackLeg {
            peer: own_id.clone(),
            side: Side::Callee,
            link: Arc::clone(&link),
            first_events: Mutex::new(Some(callee_rx)),
        });

        remote_tx
            .send(callee)
            .map_err(|_| SignalingError::PeerUnavailable(remote_id.to_string()))?;

        tracing::info!("Loopback call {} -> {}", own_id, remote_id);

        Ok(Arc::new(LoopbackLeg {
            peer: remote_id.to_string(),
            side: Side::Caller,
            link,
            first_events: Mutex::new(Some(caller_rx)),
        }))
    }
}

impl Drop for LoopbackSignaling {
    fn drop(&mut self) {
        if let Some(id) = self.id.get_mut().take() {
            self.peers.lock().remove(&id);
        }
    }
}

impl std::fmt::Debug for LoopbackSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackSignaling")
            .field("id", &*self.id.read())
            .finish()
    }
}

// ============================================================================
// CALL LEG
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Caller,
    Callee,
}

struct Link {
    caller_stream: MediaStream,
    closed: AtomicBool,
    answered: AtomicBool,
    caller_events: broadcast::Sender<LegEvent>,
    callee_events: broadcast::Sender<LegEvent>,
}

struct LoopbackLeg {
    peer: String,
    side: Side,
    link: Arc<Link>,
    /// Erster Subscriber bekommt alle Events seit Erstellung des Links
    first_events: Mutex<Option<broadcast::Receiver<LegEvent>>>,
}

impl CallHandle for LoopbackLeg {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn answer(&self, stream: &MediaStream) {
        if self.side != Side::Callee {
            tracing::warn!("Ignoring answer on outgoing leg to {}", self.peer);
            return;
        }
        if self.link.closed.load(Ordering::SeqCst) || self.link.answered.swap(true, Ordering::SeqCst)
        {
            return;
        }

        // Streams über Kreuz zustellen
        let _ = self
            .link
            .caller_events
            .send(LegEvent::Stream(stream.clone()));
        let _ = self
            .link
            .callee_events
            .send(LegEvent::Stream(self.link.caller_stream.clone()));
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.link.caller_events.send(LegEvent::Close);
        let _ = self.link.callee_events.send(LegEvent::Close);
    }

    fn subscribe(&self) -> broadcast::Receiver<LegEvent> {
        if let Some(events) = self.first_events.lock().take() {
            return events;
        }
        match self.side {
            Side::Caller => self.link.caller_events.subscribe(),
            Side::Callee => self.link.callee_events.subscribe(),
        }
    }

    fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;

    fn stream() -> MediaStream {
        MediaStream::new(vec![MediaTrack::new("mic")])
    }

    #[tokio::test]
    async fn test_call_unknown_peer_fails() {
        let network = LoopbackNetwork::new();
        let alice = network.client();
        alice.open(None).await.unwrap();

        let result = alice.call("nobody", &stream());
        assert!(matches!(result, Err(SignalingError::PeerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_call_before_open_fails() {
        let network = LoopbackNetwork::new();
        let alice = network.client();
        assert!(matches!(
            alice.call("bob", &stream()),
            Err(SignalingError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let network = LoopbackNetwork::new();
        let bob = network.client();
        bob.open(Some("bob".into())).await.unwrap();

        let impostor = network.client();
        assert_eq!(
            impostor.open(Some("bob".into())).await,
            Err(SignalingError::IdUnavailable("bob".into()))
        );
    }

    #[tokio::test]
    async fn test_answer_exchanges_streams_and_close_reaches_both() {
        let network = LoopbackNetwork::new();
        let alice = network.client();
        let bob = network.client();
        alice.open(Some("alice".into())).await.unwrap();
        bob.open(Some("bob".into())).await.unwrap();

        let mut incoming = bob.incoming_calls();
        let alice_stream = stream();
        let outgoing = alice.call("bob", &alice_stream).unwrap();
        let mut alice_events = outgoing.subscribe();

        let leg = incoming.recv().await.unwrap();
        assert_eq!(leg.peer(), "alice");
        let mut bob_events = leg.subscribe();

        let bob_stream = stream();
        leg.answer(&bob_stream);

        match alice_events.recv().await.unwrap() {
            LegEvent::Stream(s) => assert_eq!(s.id(), bob_stream.id()),
            other => panic!("unexpected event {:?}", other),
        }
        match bob_events.recv().await.unwrap() {
            LegEvent::Stream(s) => assert_eq!(s.id(), alice_stream.id()),
            other => panic!("unexpected event {:?}", other),
        }

        outgoing.close();
        assert!(leg.is_closed());
        // Weitere Subscriber sehen nur neue Events
        assert!(leg.subscribe().try_recv().is_err());
        assert!(matches!(alice_events.recv().await.unwrap(), LegEvent::Close));
        assert!(matches!(bob_events.recv().await.unwrap(), LegEvent::Close));
    }
}

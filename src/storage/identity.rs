//! Lokale Session-Identität
//!
//! Beim ersten Start vergibt der Signaling-Client eine ID, die hier
//! persistiert wird. Bei jedem weiteren Start wird dieselbe ID wieder
//! geladen und dem Signaling-Client beim Öffnen mitgegeben.

use super::{KeyValueStore, StorageError};
use crate::signaling::{SignalingClient, SignalingError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Key unter dem die Identität abgelegt wird
pub const IDENTITY_KEY: &str = "peerId";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Signaling session could not be opened: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Signaling assigned '{allocated}' but '{saved}' is persisted")]
    Mismatch { saved: String, allocated: String },
}

// ============================================================================
// IDENTITY STORE
// ============================================================================

/// Lädt oder erstellt die Identität genau einmal pro Installation
pub struct IdentityStore {
    kv: Arc<dyn KeyValueStore>,
    identity: OnceCell<String>,
}

impl IdentityStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            identity: OnceCell::new(),
        }
    }

    /// Gibt die persistierte ID zurück, ohne eine Session zu öffnen
    pub fn saved(&self) -> Result<Option<String>, StorageError> {
        self.kv.get(IDENTITY_KEY)
    }

    /// Öffnet die Signaling-Session und liefert die Identität.
    ///
    /// Gleichzeitige Aufrufe warten auf dieselbe Initialisierung, so dass
    /// nie zwei IDs vergeben und persistiert werden.
    pub async fn ensure(&self, signaling: &dyn SignalingClient) -> Result<String, IdentityError> {
        let id = self
            .identity
            .get_or_try_init(|| self.bootstrap(signaling))
            .await?;

        Ok(id.clone())
    }

    async fn bootstrap(&self, signaling: &dyn SignalingClient) -> Result<String, IdentityError> {
        let saved = self.saved()?;
        let allocated = signaling.open(saved.clone()).await?;

        match saved {
            Some(saved) if saved != allocated => Err(IdentityError::Mismatch { saved, allocated }),
            Some(saved) => {
                tracing::info!("Reloaded identity {}", saved);
                Ok(saved)
            }
            None => {
                self.kv.set(IDENTITY_KEY, &allocated)?;
                tracing::info!("Persisted new identity {}", allocated);
                Ok(allocated)
            }
        }
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("identity", &self.identity.get())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

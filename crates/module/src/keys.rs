//! Per-tender key supply.
//!
//! A [`KeyProvider`] is addressed by tender (and optionally session) id and
//! injected wherever a key is needed. Nothing in the workspace holds keys in
//! global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use tender_crypto::TenderKey;
use tender_types::{SessionId, TenderId};

use crate::config::KeyRetryConfig;

/// Errors raised by key providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("No key provisioned for {0}")]
    NotFound(TenderId),

    #[error("Key backend error for {tender_id}: {reason}")]
    Backend { tender_id: TenderId, reason: String },

    #[error("Key for {tender_id} unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        tender_id: TenderId,
        attempts: u32,
        reason: String,
    },
}

/// Supplier of tender keys. Must be safe for concurrent use.
pub trait KeyProvider: Send + Sync {
    /// Return the key of a tender, creating it if sealing is just beginning.
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError>;

    /// Look up the existing key of a tender.
    fn key_for(
        &self,
        tender_id: TenderId,
        session_id: Option<SessionId>,
    ) -> Result<TenderKey, KeyError>;
}

impl<P: KeyProvider + ?Sized> KeyProvider for Arc<P> {
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        (**self).provision(tender_id)
    }

    fn key_for(
        &self,
        tender_id: TenderId,
        session_id: Option<SessionId>,
    ) -> Result<TenderKey, KeyError> {
        (**self).key_for(tender_id, session_id)
    }
}

/// Key provider holding randomly generated keys in memory.
#[derive(Debug, Default)]
pub struct InMemoryKeyProvider {
    keys: RwLock<HashMap<TenderId, TenderKey>>,
}

/// One entry of an exported key file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyFileEntry {
    pub tender_id: TenderId,
    /// Hex-encoded 256-bit key
    pub key: String,
}

impl InMemoryKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore keys from an exported key file.
    pub fn from_entries(entries: &[KeyFileEntry]) -> Result<Self, KeyError> {
        let mut keys = HashMap::with_capacity(entries.len());
        for entry in entries {
            let key = TenderKey::from_hex(&entry.key).map_err(|e| KeyError::Backend {
                tender_id: entry.tender_id,
                reason: e.to_string(),
            })?;
            keys.insert(entry.tender_id, key);
        }
        Ok(Self {
            keys: RwLock::new(keys),
        })
    }

    /// Export all keys for storage separate from the ciphertexts.
    pub fn export(&self) -> Vec<KeyFileEntry> {
        let keys = self.keys.read();
        let mut entries: Vec<KeyFileEntry> = keys
            .iter()
            .map(|(tender_id, key)| KeyFileEntry {
                tender_id: *tender_id,
                key: key.to_hex(),
            })
            .collect();
        entries.sort_by_key(|e| e.tender_id);
        entries
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

impl KeyProvider for InMemoryKeyProvider {
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        let mut keys = self.keys.write();
        let key = keys.entry(tender_id).or_insert_with(|| {
            info!(tender_id = tender_id.0, "Provisioned tender key");
            TenderKey::generate(&mut OsRng)
        });
        Ok(key.clone())
    }

    fn key_for(
        &self,
        tender_id: TenderId,
        _session_id: Option<SessionId>,
    ) -> Result<TenderKey, KeyError> {
        self.keys
            .read()
            .get(&tender_id)
            .cloned()
            .ok_or(KeyError::NotFound(tender_id))
    }
}

/// Key provider deriving every tender key from one master secret.
pub struct DerivedKeyProvider {
    master_secret: Zeroizing<Vec<u8>>,
}

impl DerivedKeyProvider {
    pub fn new(master_secret: Vec<u8>) -> Self {
        Self {
            master_secret: Zeroizing::new(master_secret),
        }
    }

    fn derive(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        TenderKey::derive(&self.master_secret, tender_id).map_err(|e| KeyError::Backend {
            tender_id,
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for DerivedKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeyProvider")
            .field("master_secret", &"***")
            .finish()
    }
}

impl KeyProvider for DerivedKeyProvider {
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        self.derive(tender_id)
    }

    fn key_for(
        &self,
        tender_id: TenderId,
        _session_id: Option<SessionId>,
    ) -> Result<TenderKey, KeyError> {
        self.derive(tender_id)
    }
}

/// Wraps a provider and retries failed lookups with exponential backoff.
#[derive(Debug)]
pub struct RetryingKeyProvider<P> {
    inner: P,
    config: KeyRetryConfig,
}

impl<P: KeyProvider> RetryingKeyProvider<P> {
    pub fn new(inner: P, config: KeyRetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn with_retry<F>(&self, tender_id: TenderId, mut lookup: F) -> Result<TenderKey, KeyError>
    where
        F: FnMut() -> Result<TenderKey, KeyError>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            match lookup() {
                Ok(key) => {
                    if attempt > 1 {
                        debug!(tender_id = tender_id.0, attempt, "Key lookup recovered");
                    }
                    return Ok(key);
                }
                Err(e) => {
                    warn!(
                        tender_id = tender_id.0,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Key lookup failed"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        thread::sleep(self.config.backoff_for(attempt));
                    }
                }
            }
        }

        Err(KeyError::Unavailable {
            tender_id,
            attempts: max_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".into()),
        })
    }
}

impl<P: KeyProvider> KeyProvider for RetryingKeyProvider<P> {
    fn provision(&self, tender_id: TenderId) -> Result<TenderKey, KeyError> {
        self.with_retry(tender_id, || self.inner.provision(tender_id))
    }

    fn key_for(
        &self,
        tender_id: TenderId,
        session_id: Option<SessionId>,
    ) -> Result<TenderKey, KeyError> {
        self.with_retry(tender_id, || self.inner.key_for(tender_id, session_id))
    }
}

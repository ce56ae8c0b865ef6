use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domains::envelope::Envelope;
use crate::error::{Result, WalletBridgeError};
use crate::interfaces::storage::KeyValueStore;
use crate::services::messenger::EnvelopeGuard;

pub mod store;

pub const IDENTITY_KEY: &str = "extensionId";
const IDENTITY_LEN: usize = 32;

/// Per-install random token attached to extension-internal envelopes.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtensionIdentity(String);

impl ExtensionIdentity {
    pub fn generate() -> Self {
        let mut raw = [0u8; IDENTITY_LEN];
        OsRng.fill_bytes(&mut raw);
        Self(BASE64.encode(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short digest that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        BASE64.encode(&digest[..6])
    }
}

impl fmt::Debug for ExtensionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtensionIdentity({})", self.fingerprint())
    }
}

pub struct IdentityRegistry {
    store: Arc<dyn KeyValueStore>,
    cached: Mutex<Option<ExtensionIdentity>>,
}

impl IdentityRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// Returns the install identity, generating and persisting it on first use.
    pub async fn get(&self) -> Result<ExtensionIdentity> {
        let mut cached = self.cached.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.store.get(IDENTITY_KEY).await? {
            Some(stored) if stored.trim().is_empty() => {
                return Err(WalletBridgeError::Runtime(
                    "stored extension identity is empty".to_string(),
                ));
            }
            Some(stored) => {
                let identity = ExtensionIdentity(stored);
                debug!(fingerprint = %identity.fingerprint(), "loaded extension identity");
                identity
            }
            None => {
                let identity = ExtensionIdentity::generate();
                self.store.set(IDENTITY_KEY, identity.as_str()).await?;
                info!(fingerprint = %identity.fingerprint(), "generated extension identity");
                identity
            }
        };

        *cached = Some(identity.clone());
        Ok(identity)
    }

    pub async fn validate(&self, candidate: Option<&str>) -> Result<()> {
        let expected = self.get().await?;
        match candidate {
            Some(value) if value == expected.as_str() => Ok(()),
            Some(_) => Err(WalletBridgeError::Validation(
                "extension identity mismatch".to_string(),
            )),
            None => Err(WalletBridgeError::Validation(
                "missing extension identity".to_string(),
            )),
        }
    }
}

/// Rejects inbound envelopes whose tagged identity is not this install's.
pub struct IdentityGuard {
    registry: Arc<IdentityRegistry>,
}

impl IdentityGuard {
    pub fn new(registry: Arc<IdentityRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl EnvelopeGuard for IdentityGuard {
    async fn check(&self, envelope: &Envelope) -> Result<()> {
        self.registry.validate(envelope.identity()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::store::MemoryStore;

    #[tokio::test]
    async fn generates_once_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let registry = IdentityRegistry::new(store.clone());
        let first = registry.get().await.unwrap();
        let second = registry.get().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.get(IDENTITY_KEY).await.unwrap().as_deref(),
            Some(first.as_str())
        );

        let other_context = IdentityRegistry::new(store);
        assert_eq!(other_context.get().await.unwrap(), first);
    }

    #[tokio::test]
    async fn concurrent_first_use_yields_one_identity() {
        let registry = Arc::new(IdentityRegistry::new(Arc::new(MemoryStore::new())));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.get().await.unwrap() }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        assert!(seen.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn validate_rejects_mismatch_and_absence() {
        let registry = IdentityRegistry::new(Arc::new(MemoryStore::new()));
        let identity = registry.get().await.unwrap();
        registry.validate(Some(identity.as_str())).await.unwrap();
        assert!(matches!(
            registry.validate(Some("forged")).await,
            Err(WalletBridgeError::Validation(_))
        ));
        assert!(matches!(
            registry.validate(None).await,
            Err(WalletBridgeError::Validation(_))
        ));
    }

    #[test]
    fn debug_output_does_not_leak_the_token() {
        let identity = ExtensionIdentity::generate();
        assert!(!format!("{identity:?}").contains(identity.as_str()));
    }
}

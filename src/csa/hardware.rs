use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use p256::{ecdsa::SigningKey, PublicKey};
use rand::rngs::OsRng;
use tracing::debug;

use super::{
    attestation::{KeyAttestation, SoftwareAttestationIssuer},
    crypto::{public_key_bytes, sign},
    protocol::UserAuthType,
};

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("no local key with alias '{0}'")]
    KeyNotFound(String),
    #[error("user authentication required")]
    UserNotAuthenticated,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Access control for a local key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalKeyPolicy {
    pub user_authentication_required: bool,
    pub user_authentication_types: Vec<UserAuthType>,
}

/// Platform secure hardware holding the device-local keys: the binding
/// key, the device attestation key and one companion key per remote key.
#[async_trait]
pub trait SecureHardware: Send + Sync {
    /// Creates (or replaces) a P-256 key and attests it over `challenge`.
    async fn create_key(
        &self,
        alias: &str,
        challenge: &[u8],
        policy: &LocalKeyPolicy,
    ) -> Result<KeyAttestation, HardwareError>;

    /// ES256 signature in raw `r || s` form.
    async fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, HardwareError>;

    async fn delete_key(&self, alias: &str) -> Result<(), HardwareError>;
}

#[async_trait]
impl<T: SecureHardware + ?Sized> SecureHardware for Arc<T> {
    async fn create_key(
        &self,
        alias: &str,
        challenge: &[u8],
        policy: &LocalKeyPolicy,
    ) -> Result<KeyAttestation, HardwareError> {
        self.as_ref().create_key(alias, challenge, policy).await
    }

    async fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, HardwareError> {
        self.as_ref().sign(alias, data).await
    }

    async fn delete_key(&self, alias: &str) -> Result<(), HardwareError> {
        self.as_ref().delete_key(alias).await
    }
}

struct LocalKey {
    key: SigningKey,
    policy: LocalKeyPolicy,
}

/// In-memory [SecureHardware] attesting with a [SoftwareAttestationIssuer].
pub struct SoftwareSecureHardware {
    issuer: SoftwareAttestationIssuer,
    keys: Mutex<HashMap<String, LocalKey>>,
    user_authenticated: AtomicBool,
}

impl SoftwareSecureHardware {
    pub fn new(issuer: SoftwareAttestationIssuer) -> Self {
        Self {
            issuer,
            keys: Mutex::new(HashMap::new()),
            user_authenticated: AtomicBool::new(true),
        }
    }

    pub fn issuer(&self) -> &SoftwareAttestationIssuer {
        &self.issuer
    }

    /// Simulates the user unlocking (or not) the device. Keys whose policy
    /// requires user authentication refuse to sign while this is `false`.
    pub fn set_user_authenticated(&self, authenticated: bool) {
        self.user_authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn contains_key(&self, alias: &str) -> bool {
        self.keys
            .lock()
            .map(|keys| keys.contains_key(alias))
            .unwrap_or(false)
    }

    fn keys(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LocalKey>>, HardwareError> {
        self.keys
            .lock()
            .map_err(|_| HardwareError::Other(anyhow::anyhow!("key table poisoned")))
    }
}

impl Default for SoftwareSecureHardware {
    fn default() -> Self {
        Self::new(SoftwareAttestationIssuer::generate())
    }
}

#[async_trait]
impl SecureHardware for SoftwareSecureHardware {
    async fn create_key(
        &self,
        alias: &str,
        challenge: &[u8],
        policy: &LocalKeyPolicy,
    ) -> Result<KeyAttestation, HardwareError> {
        let key = SigningKey::random(&mut OsRng);
        let public_key = public_key_bytes(&PublicKey::from(key.verifying_key()));
        let attestation = self
            .issuer
            .attest(&public_key, challenge)
            .map_err(|e| HardwareError::Other(e.into()))?;

        self.keys()?.insert(
            alias.to_owned(),
            LocalKey {
                key,
                policy: policy.clone(),
            },
        );
        debug!(alias, "Created local key");
        Ok(attestation)
    }

    async fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, HardwareError> {
        let keys = self.keys()?;
        let local = keys
            .get(alias)
            .ok_or_else(|| HardwareError::KeyNotFound(alias.to_owned()))?;
        if local.policy.user_authentication_required
            && !self.user_authenticated.load(Ordering::SeqCst)
        {
            return Err(HardwareError::UserNotAuthenticated);
        }
        Ok(sign(&local.key, data))
    }

    async fn delete_key(&self, alias: &str) -> Result<(), HardwareError> {
        self.keys()?.remove(alias);
        Ok(())
    }
}

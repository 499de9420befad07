use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{
    attestation::KeyAttestation,
    crypto::SessionKeys,
    protocol::{KeyPurpose, UserAuthType},
};

/// Hardware alias of the device binding key.
pub const BINDING_KEY_ALIAS: &str = "csa.binding";
/// Hardware alias of the key asserting the device during E2EE setup.
pub const DEVICE_ATTESTATION_ALIAS: &str = "csa.device_attestation";

pub(crate) fn companion_key_alias(alias: &str) -> String {
    format!("csa.key.{alias}")
}

/// Durable outcome of registering with a Cloud Secure Area.
///
/// Callers persist this with their storage engine and hand it back through
/// [CloudSecureArea::with_registration](super::CloudSecureArea::with_registration)
/// after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Opaque to the client.
    pub registration_context: ByteBuf,
    /// Alias of the local key asserting the device during E2EE setup.
    pub device_attestation_id: String,
    pub binding_key_alias: String,
    /// SEC1 public key of the cloud binding key. Authenticates every E2EE
    /// setup.
    pub cloud_binding_key: ByteBuf,
    #[serde(default)]
    pub keys: BTreeMap<String, KeyMetadata>,
}

/// What is known about a remote key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    pub alias: String,
    pub purposes: Vec<KeyPurpose>,
    /// Seconds since the Unix epoch.
    pub valid_from: Option<u64>,
    pub valid_until: Option<u64>,
    pub passphrase_required: bool,
    pub user_authentication_required: bool,
    pub user_authentication_types: Vec<UserAuthType>,
    /// Attestation of the remote key, chain fully assembled.
    pub attestation: KeyAttestation,
    pub(crate) key_context: ByteBuf,
}

impl KeyMetadata {
    /// JOSE name of the algorithm the key is used with.
    pub fn algorithm(&self) -> &'static str {
        if self.purposes.contains(&KeyPurpose::Sign) {
            "ES256"
        } else {
            "ECDH-ES"
        }
    }

    pub fn public_key(&self) -> &[u8] {
        self.attestation.public_key()
    }

    /// Alias of the companion key in the device's secure hardware.
    pub fn local_key_alias(&self) -> String {
        companion_key_alias(&self.alias)
    }
}

/// Volatile E2EE session state. Dropped whenever the session cannot be
/// trusted to be in sync with the server anymore.
#[derive(Debug)]
pub(crate) struct Session {
    pub keys: SessionKeys,
    pub encrypted_counter: u32,
    pub decrypted_counter: u32,
    pub e2ee_context: ByteBuf,
}

impl Session {
    pub fn new(keys: SessionKeys, e2ee_context: ByteBuf) -> Self {
        Self {
            keys,
            encrypted_counter: 1,
            decrypted_counter: 1,
            e2ee_context,
        }
    }
}

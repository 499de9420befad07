//! Key attestations exchanged by both sides of the protocol.
//!
//! Platform attestation formats are opaque to this crate. A
//! [KeyAttestation] carries the attested public key, the challenge the
//! attesting party embedded and a certificate chain that only the caller's
//! [AttestationAuthorizer] interprets. [SoftwareAttestationIssuer] produces
//! chains that [IssuerAuthorizer] accepts, which is enough to run the
//! protocol without platform keystores.

use anyhow::{bail, Context};
use p256::{ecdsa::SigningKey, PublicKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{
    crypto::{cbor_array, public_key_bytes, sign, verify},
    error::CloudError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAttestation {
    /// SEC1-encoded, uncompressed.
    pub public_key: ByteBuf,
    /// The challenge supplied by the party that requested the attestation.
    pub challenge: ByteBuf,
    pub certificate_chain: Vec<ByteBuf>,
}

impl KeyAttestation {
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }
}

/// Decides whether an attestation chains to a trusted root.
pub trait AttestationAuthorizer: Send + Sync {
    fn authorize(&self, attestation: &KeyAttestation) -> anyhow::Result<()>;
}

/// Checks that `attestation` embeds `expected_challenge` and is accepted by
/// `authorizer`.
pub fn validate_attestation(
    attestation: &KeyAttestation,
    expected_challenge: &[u8],
    authorizer: &dyn AttestationAuthorizer,
) -> Result<(), CloudError> {
    if attestation.challenge.as_slice() != expected_challenge {
        return Err(CloudError::attestation("challenge mismatch"));
    }
    authorizer
        .authorize(attestation)
        .map_err(|e| CloudError::attestation(format!("{e:#}")))
}

/// Attests keys with a software root key.
///
/// The chain is `[signature, root public key]` where the signature covers
/// the CBOR array `[public key, challenge]`.
#[derive(Clone)]
pub struct SoftwareAttestationIssuer {
    root: SigningKey,
}

impl SoftwareAttestationIssuer {
    pub fn new(root: SigningKey) -> Self {
        Self { root }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    pub fn root_public_key(&self) -> Vec<u8> {
        public_key_bytes(&PublicKey::from(self.root.verifying_key()))
    }

    pub fn attest(&self, public_key: &[u8], challenge: &[u8]) -> Result<KeyAttestation, CloudError> {
        let signature = sign(&self.root, &attested_data(public_key, challenge)?);
        Ok(KeyAttestation {
            public_key: ByteBuf::from(public_key.to_vec()),
            challenge: ByteBuf::from(challenge.to_vec()),
            certificate_chain: vec![
                ByteBuf::from(signature),
                ByteBuf::from(self.root_public_key()),
            ],
        })
    }

    /// An authorizer trusting only this issuer.
    pub fn authorizer(&self) -> IssuerAuthorizer {
        IssuerAuthorizer::new(vec![self.root_public_key()])
    }
}

impl std::fmt::Debug for SoftwareAttestationIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareAttestationIssuer")
            .field("root", &self.root_public_key())
            .finish()
    }
}

/// Accepts attestations produced by a [SoftwareAttestationIssuer] whose
/// root is in `trusted_roots`.
#[derive(Debug, Clone)]
pub struct IssuerAuthorizer {
    trusted_roots: Vec<Vec<u8>>,
}

impl IssuerAuthorizer {
    pub fn new(trusted_roots: Vec<Vec<u8>>) -> Self {
        Self { trusted_roots }
    }
}

impl AttestationAuthorizer for IssuerAuthorizer {
    fn authorize(&self, attestation: &KeyAttestation) -> anyhow::Result<()> {
        let [signature, root] = attestation.certificate_chain.as_slice() else {
            bail!(
                "expected a chain of 2 entries, got {}",
                attestation.certificate_chain.len()
            );
        };
        if !self.trusted_roots.iter().any(|trusted| trusted == root.as_slice()) {
            bail!("untrusted root");
        }
        let data = attested_data(&attestation.public_key, &attestation.challenge)
            .context("unable to encode attested data")?;
        if !verify(root, &data, signature) {
            bail!("invalid attestation signature");
        }
        Ok(())
    }
}

fn attested_data(public_key: &[u8], challenge: &[u8]) -> Result<Vec<u8>, CloudError> {
    cbor_array(vec![
        ciborium::Value::Bytes(public_key.to_vec()),
        ciborium::Value::Bytes(challenge.to_vec()),
    ])
}

//! Cryptographic building blocks shared by the client and the server.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use ciborium::Value as Cbor;
use hkdf::Hkdf;
use p256::{
    ecdsa::{
        signature::{Signer as _, Verifier as _},
        Signature, SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use super::error::CloudError;

/// Size of the nonces and challenges exchanged during handshakes.
pub const NONCE_LEN: usize = 16;

/// Which party encrypted a message. Part of the AES-GCM IV so the two
/// directions never share an IV although their keys derive from one secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceToCloud,
    CloudToDevice,
}

impl Direction {
    fn flag(self) -> u32 {
        match self {
            Direction::DeviceToCloud => 0x0000_0000,
            Direction::CloudToDevice => 0x0000_0001,
        }
    }
}

/// `0x00000000 || direction flag || counter`, all big endian.
pub fn iv(direction: Direction, counter: u32) -> [u8; 12] {
    let mut iv = [0u8; 12];
    iv[4..8].copy_from_slice(&direction.flag().to_be_bytes());
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

/// Symmetric keys of one E2EE session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Encrypts device to cloud messages.
    pub sk_device: [u8; 32],
    /// Encrypts cloud to device messages.
    pub sk_cloud: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    /// HKDF-SHA256 over the ECDH secret, salted with
    /// `SHA-256(device_nonce || cloud_nonce)`.
    pub fn derive(
        shared_secret: &[u8],
        device_nonce: &[u8],
        cloud_nonce: &[u8],
    ) -> Result<Self, CloudError> {
        let salt = Sha256::new()
            .chain_update(device_nonce)
            .chain_update(cloud_nonce)
            .finalize();
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);

        let mut sk_device = [0u8; 32];
        let mut sk_cloud = [0u8; 32];
        hkdf.expand(b"SKDevice", &mut sk_device)
            .and_then(|_| hkdf.expand(b"SKCloud", &mut sk_cloud))
            .map_err(|e| CloudError::protocol(format!("key derivation failed: {e}")))?;

        Ok(Self {
            sk_device,
            sk_cloud,
        })
    }

    pub fn key(&self, direction: Direction) -> &[u8; 32] {
        match direction {
            Direction::DeviceToCloud => &self.sk_device,
            Direction::CloudToDevice => &self.sk_cloud,
        }
    }
}

pub fn encrypt(
    key: &[u8; 32],
    direction: Direction,
    counter: u32,
    plaintext: &[u8],
) -> Result<Vec<u8>, CloudError> {
    let iv = iv(direction, counter);
    Aes256Gcm::new(key.into())
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CloudError::protocol("encryption failed"))
}

pub fn decrypt(
    key: &[u8; 32],
    direction: Direction,
    counter: u32,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CloudError> {
    let iv = iv(direction, counter);
    Aes256Gcm::new(key.into())
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| CloudError::Decryption)
}

/// The data signed by each party's binding key during E2EE setup.
pub fn e2ee_transcript(
    ephemeral_key: &[u8],
    cloud_nonce: &[u8],
    device_nonce: &[u8],
) -> Result<Vec<u8>, CloudError> {
    cbor_array(vec![
        Cbor::Bytes(ephemeral_key.to_vec()),
        Cbor::Bytes(cloud_nonce.to_vec()),
        Cbor::Bytes(device_nonce.to_vec()),
    ])
}

pub(crate) fn cbor_array(items: Vec<Cbor>) -> Result<Vec<u8>, CloudError> {
    let mut buf = Vec::new();
    ciborium::into_writer(&Cbor::Array(items), &mut buf)
        .map_err(|e| CloudError::protocol(format!("unable to encode CBOR: {e}")))?;
    Ok(buf)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Uncompressed SEC1 encoding.
pub fn public_key_bytes(key: &PublicKey) -> Vec<u8> {
    key.to_encoded_point(false).as_bytes().to_vec()
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CloudError> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| CloudError::protocol("invalid P-256 public key"))
}

/// ES256 signature, raw `r || s`.
pub fn sign(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let signature: Signature = key.sign(data);
    signature.to_bytes().to_vec()
}

pub fn verify(public_key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_sec1_bytes(public_key) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    key.verify(data, &signature).is_ok()
}

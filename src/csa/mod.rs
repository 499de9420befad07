//! Client for a Cloud Secure Area.
//!
//! Private keys live in a remote secure enclave and never leave it. Each
//! remote key is bound to a companion key in the device's secure hardware,
//! so the server only uses a key after the device proves possession of the
//! companion key and, when configured, the user supplies the passphrase.
//!
//! The protocol runs in three stages:
//!
//! 1. Registration stage 1 exchanges mutually attested binding keys.
//! 2. An E2EE session is set up with ephemeral ECDH keys signed by the
//!    binding keys. Session keys derive through HKDF-SHA256 and every later
//!    message is AES-GCM encrypted with a per-direction counter in the IV.
//! 3. Registration stage 2, key creation and key use all run inside the
//!    E2EE session.
//!
//! [CloudSecureAreaServer] implements the server side so the whole
//! protocol can run in-process.

mod attestation;
mod client;
mod config;
pub mod crypto;
mod error;
mod hardware;
mod key;
pub mod protocol;
mod server;
mod session;

pub use attestation::{
    validate_attestation, AttestationAuthorizer, IssuerAuthorizer, KeyAttestation,
    SoftwareAttestationIssuer,
};
pub use client::CloudSecureArea;
pub use config::{CloudSecureAreaConfig, CloudServerConfig, PassphraseConstraints};
pub use error::{CloudError, KeyLockedReason, Result};
pub use hardware::{HardwareError, LocalKeyPolicy, SecureHardware, SoftwareSecureHardware};
pub use key::{KeySettings, KeyUnlockData, PassphrasePrompt};
pub use protocol::{KeyPurpose, UserAuthType};
pub use server::CloudSecureAreaServer;
pub use session::{KeyMetadata, Registration, BINDING_KEY_ALIAS, DEVICE_ATTESTATION_ALIAS};

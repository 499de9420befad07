//! Wire messages of the Cloud Secure Area protocol.
//!
//! Every message is a CBOR map keyed by field name with a `type`
//! discriminator naming the variant. Messages with an unknown `type`, or
//! fields of the wrong type, are rejected.
//!
//! Fields named `serverState`, `registrationContext`, `e2eeContext` and
//! `keyContext` carry continuation state opaque to the client, which must
//! echo it back unmodified.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{attestation::KeyAttestation, error::CloudError};

pub const RESULT_OK: u32 = 0;
pub const RESULT_WRONG_PASSPHRASE: u32 = 1;
pub const RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS: u32 = 2;

/// What a remote key may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyPurpose {
    Sign,
    KeyAgreement,
}

/// A kind of local user authentication guarding the companion key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserAuthType {
    Passcode,
    Biometric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    RegisterRequest0(RegisterRequest0),
    RegisterResponse0(RegisterResponse0),
    RegisterRequest1(RegisterRequest1),
    RegisterResponse1(RegisterResponse1),
    RegisterStage2Request0(RegisterStage2Request0),
    RegisterStage2Response0(RegisterStage2Response0),
    #[serde(rename = "E2EESetupRequest0")]
    E2eeSetupRequest0(E2eeSetupRequest0),
    #[serde(rename = "E2EESetupResponse0")]
    E2eeSetupResponse0(E2eeSetupResponse0),
    #[serde(rename = "E2EESetupRequest1")]
    E2eeSetupRequest1(E2eeSetupRequest1),
    #[serde(rename = "E2EESetupResponse1")]
    E2eeSetupResponse1(E2eeSetupResponse1),
    #[serde(rename = "E2EERequest")]
    E2eeRequest(E2eeRequest),
    #[serde(rename = "E2EEResponse")]
    E2eeResponse(E2eeResponse),
    CreateKeyRequest0(CreateKeyRequest0),
    CreateKeyResponse0(CreateKeyResponse0),
    CreateKeyRequest1(CreateKeyRequest1),
    CreateKeyResponse1(CreateKeyResponse1),
    SignRequest0(SignRequest0),
    SignResponse0(SignResponse0),
    SignRequest1(SignRequest1),
    SignResponse1(SignResponse1),
    KeyAgreementRequest0(KeyAgreementRequest0),
    KeyAgreementResponse0(KeyAgreementResponse0),
    KeyAgreementRequest1(KeyAgreementRequest1),
    KeyAgreementResponse1(KeyAgreementResponse1),
    CheckPassphraseRequest(CheckPassphraseRequest),
    CheckPassphraseResponse(CheckPassphraseResponse),
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>, CloudError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CloudError::protocol(format!("unable to encode {}: {e}", self.name())))?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CloudError> {
        ciborium::from_reader(bytes)
            .map_err(|e| CloudError::protocol(format!("unable to decode message: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterRequest0(_) => "RegisterRequest0",
            Self::RegisterResponse0(_) => "RegisterResponse0",
            Self::RegisterRequest1(_) => "RegisterRequest1",
            Self::RegisterResponse1(_) => "RegisterResponse1",
            Self::RegisterStage2Request0(_) => "RegisterStage2Request0",
            Self::RegisterStage2Response0(_) => "RegisterStage2Response0",
            Self::E2eeSetupRequest0(_) => "E2EESetupRequest0",
            Self::E2eeSetupResponse0(_) => "E2EESetupResponse0",
            Self::E2eeSetupRequest1(_) => "E2EESetupRequest1",
            Self::E2eeSetupResponse1(_) => "E2EESetupResponse1",
            Self::E2eeRequest(_) => "E2EERequest",
            Self::E2eeResponse(_) => "E2EEResponse",
            Self::CreateKeyRequest0(_) => "CreateKeyRequest0",
            Self::CreateKeyResponse0(_) => "CreateKeyResponse0",
            Self::CreateKeyRequest1(_) => "CreateKeyRequest1",
            Self::CreateKeyResponse1(_) => "CreateKeyResponse1",
            Self::SignRequest0(_) => "SignRequest0",
            Self::SignResponse0(_) => "SignResponse0",
            Self::SignRequest1(_) => "SignRequest1",
            Self::SignResponse1(_) => "SignResponse1",
            Self::KeyAgreementRequest0(_) => "KeyAgreementRequest0",
            Self::KeyAgreementResponse0(_) => "KeyAgreementResponse0",
            Self::KeyAgreementRequest1(_) => "KeyAgreementRequest1",
            Self::KeyAgreementResponse1(_) => "KeyAgreementResponse1",
            Self::CheckPassphraseRequest(_) => "CheckPassphraseRequest",
            Self::CheckPassphraseResponse(_) => "CheckPassphraseResponse",
        }
    }
}

/// Extracts the expected variant from a response, failing with a protocol
/// error naming what arrived instead.
macro_rules! expect_response {
    ($command:expr, $variant:ident) => {
        match $command {
            $crate::csa::protocol::Command::$variant(inner) => Ok(inner),
            other => Err($crate::csa::CloudError::protocol(format!(
                "expected {}, got {}",
                stringify!($variant),
                other.name()
            ))),
        }
    };
}
pub(crate) use expect_response;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest0 {
    pub client_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse0 {
    pub cloud_challenge: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest1 {
    pub device_challenge: ByteBuf,
    pub device_attestation: KeyAttestation,
    pub device_binding_key_attestation: KeyAttestation,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse1 {
    pub cloud_binding_key_attestation: KeyAttestation,
    pub registration_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStage2Request0 {
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterStage2Response0 {
    pub registration_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeSetupRequest0 {
    pub registration_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeSetupResponse0 {
    pub cloud_nonce: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeSetupRequest1 {
    /// SEC1-encoded ephemeral public key of the device.
    pub e_device_key: ByteBuf,
    pub device_nonce: ByteBuf,
    /// Device binding key signature over the E2EE transcript.
    pub signature: ByteBuf,
    /// Device attestation key signature over the cloud nonce.
    pub device_assertion: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeSetupResponse1 {
    pub e_cloud_key: ByteBuf,
    /// Cloud binding key signature over the E2EE transcript.
    pub signature: ByteBuf,
    pub e2ee_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeRequest {
    pub encrypted_request: ByteBuf,
    pub e2ee_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeResponse {
    pub encrypted_response: ByteBuf,
    pub e2ee_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest0 {
    pub purposes: Vec<KeyPurpose>,
    /// Seconds since the Unix epoch.
    pub valid_from: Option<u64>,
    pub valid_until: Option<u64>,
    pub passphrase_required: bool,
    pub user_authentication_required: bool,
    pub user_authentication_types: Vec<UserAuthType>,
    /// Challenge the server must embed in the remote key attestations.
    pub challenge: ByteBuf,
    pub batch_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyResponse0 {
    pub cloud_challenge: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest1 {
    pub local_key_attestations: Vec<KeyAttestation>,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyResponse1 {
    pub remote_key_attestations: Vec<KeyAttestation>,
    pub key_contexts: Vec<ByteBuf>,
    /// Intermediate certificate shared by every remote key attestation.
    pub common_intermediate: Option<ByteBuf>,
    /// Cloud binding key signature over the whole batch.
    pub batch_attestation: Option<ByteBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest0 {
    pub data_to_sign: ByteBuf,
    pub key_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse0 {
    pub cloud_nonce: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest1 {
    /// Local companion key signature over the cloud nonce.
    pub signature: ByteBuf,
    pub passphrase: Option<String>,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse1 {
    pub result: u32,
    pub signature: Option<ByteBuf>,
    pub wait_duration_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAgreementRequest0 {
    /// SEC1-encoded public key of the peer.
    pub other_public_key: ByteBuf,
    pub key_context: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAgreementResponse0 {
    pub cloud_nonce: ByteBuf,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAgreementRequest1 {
    pub signature: ByteBuf,
    pub passphrase: Option<String>,
    pub server_state: ByteBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAgreementResponse1 {
    pub result: u32,
    pub zab: Option<ByteBuf>,
    pub wait_duration_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPassphraseRequest {
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPassphraseResponse {
    pub result: u32,
    pub wait_duration_millis: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciborium::Value as Cbor;

    fn to_bytes(value: &Cbor) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).unwrap();
        buf
    }

    #[test]
    fn messages_are_maps_with_a_type_discriminator() {
        let command = Command::SignResponse1(SignResponse1 {
            result: RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS,
            signature: None,
            wait_duration_millis: 2000,
        });
        let bytes = command.encode().unwrap();

        let value: Cbor = ciborium::from_reader(bytes.as_slice()).unwrap();
        let map = value.as_map().unwrap();
        assert!(map.contains(&(Cbor::Text("type".into()), Cbor::Text("SignResponse1".into()))));
        assert!(map.contains(&(
            Cbor::Text("waitDurationMillis".into()),
            Cbor::Integer(2000.into())
        )));

        assert_eq!(Command::decode(&bytes).unwrap(), command);
    }

    #[test]
    fn binary_fields_survive_encoding() {
        let command = Command::E2eeRequest(E2eeRequest {
            encrypted_request: ByteBuf::from(vec![1, 2, 3]),
            e2ee_context: ByteBuf::from(vec![0xff; 40]),
        });
        let decoded = Command::decode(&command.encode().unwrap()).unwrap();
        let inner = expect_response!(decoded, E2eeRequest).unwrap();
        assert_eq!(inner.encrypted_request.as_slice(), &[1, 2, 3]);
        assert_eq!(inner.e2ee_context.len(), 40);
    }

    #[test]
    fn unknown_types_are_rejected() {
        let bytes = to_bytes(&Cbor::Map(vec![
            (Cbor::Text("type".into()), Cbor::Text("FormatDiskRequest".into())),
            (Cbor::Text("passphrase".into()), Cbor::Text("x".into())),
        ]));
        assert!(matches!(Command::decode(&bytes), Err(CloudError::Protocol(_))));
    }

    #[test]
    fn mistyped_fields_are_rejected() {
        let bytes = to_bytes(&Cbor::Map(vec![
            (Cbor::Text("type".into()), Cbor::Text("CheckPassphraseResponse".into())),
            (Cbor::Text("result".into()), Cbor::Text("ok".into())),
            (Cbor::Text("waitDurationMillis".into()), Cbor::Integer(0.into())),
        ]));
        assert!(matches!(Command::decode(&bytes), Err(CloudError::Protocol(_))));

        let not_a_map = to_bytes(&Cbor::Array(vec![Cbor::Text("RegisterRequest0".into())]));
        assert!(Command::decode(&not_a_map).is_err());
    }

    #[test]
    fn unexpected_responses_are_protocol_errors() {
        let command = Command::CheckPassphraseRequest(CheckPassphraseRequest {
            passphrase: "1234".into(),
        });
        let result = expect_response!(command, CheckPassphraseResponse);
        assert!(
            matches!(result, Err(CloudError::Protocol(reason)) if reason.contains("CheckPassphraseRequest"))
        );
    }
}

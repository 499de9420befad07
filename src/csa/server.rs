//! Reference implementation of the server side of the protocol.
//!
//! The server keeps no per-client state except brute-force counters. All
//! continuation state is sealed with AES-256-GCM under a server secret and
//! handed to the client as the opaque `serverState`, `registrationContext`,
//! `e2eeContext` and key context blobs.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};
use anyhow::Context;
use async_trait::async_trait;
use http::{header::CONTENT_TYPE, Request, Response, StatusCode};
use p256::{ecdh::EphemeralSecret, ecdsa::SigningKey, PublicKey, SecretKey};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    attestation::{validate_attestation, AttestationAuthorizer, SoftwareAttestationIssuer},
    config::{millis, CloudServerConfig},
    crypto::{
        self, cbor_array, e2ee_transcript, parse_public_key, public_key_bytes, random_bytes,
        sign, verify, Direction, SessionKeys, NONCE_LEN,
    },
    error::CloudError,
    protocol::{
        CheckPassphraseResponse, Command, CreateKeyRequest0, CreateKeyRequest1,
        CreateKeyResponse0, CreateKeyResponse1, E2eeRequest, E2eeResponse, E2eeSetupRequest0,
        E2eeSetupRequest1, E2eeSetupResponse0, E2eeSetupResponse1, KeyAgreementResponse0,
        KeyAgreementResponse1, KeyPurpose, RegisterRequest0, RegisterRequest1,
        RegisterResponse0, RegisterResponse1, RegisterStage2Response0, SignResponse0,
        SignResponse1, RESULT_OK, RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS, RESULT_WRONG_PASSPHRASE,
    },
};
use crate::core::util::{AsyncHttpClient, CBOR_CONTENT_TYPE};

#[derive(Debug, thiserror::Error)]
enum ServerError {
    /// Answered with 400 so the client sets up a new E2EE session.
    #[error("E2EE session must be re-established: {0}")]
    Rekey(&'static str),
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationRecord {
    id: String,
    device_attestation_key: ByteBuf,
    device_binding_key: ByteBuf,
    /// Private scalar.
    cloud_binding_key: ByteBuf,
    passphrase: Option<PassphraseDigest>,
}

impl RegistrationRecord {
    fn cloud_binding_key(&self) -> Result<SigningKey, CloudError> {
        signing_key(&self.cloud_binding_key)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PassphraseDigest {
    salt: ByteBuf,
    digest: ByteBuf,
}

impl PassphraseDigest {
    fn new(passphrase: &str) -> Self {
        let salt = random_bytes(NONCE_LEN);
        let digest = Self::digest(&salt, passphrase);
        Self {
            salt: ByteBuf::from(salt),
            digest: ByteBuf::from(digest),
        }
    }

    fn digest(salt: &[u8], passphrase: &str) -> Vec<u8> {
        Sha256::new()
            .chain_update(salt)
            .chain_update(passphrase.as_bytes())
            .finalize()
            .to_vec()
    }

    fn matches(&self, passphrase: &str) -> bool {
        Self::digest(&self.salt, passphrase) == self.digest.as_slice()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct E2eeRecord {
    epoch: u64,
    registration: RegistrationRecord,
    sk_device: ByteBuf,
    sk_cloud: ByteBuf,
    device_counter: u32,
    cloud_counter: u32,
}

impl E2eeRecord {
    fn keys(&self) -> Result<SessionKeys, CloudError> {
        let key = |bytes: &ByteBuf| {
            <[u8; 32]>::try_from(bytes.as_slice())
                .map_err(|_| CloudError::protocol("malformed session key"))
        };
        Ok(SessionKeys {
            sk_device: key(&self.sk_device)?,
            sk_cloud: key(&self.sk_cloud)?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    registration_id: String,
    private_key: ByteBuf,
    /// SEC1 public key of the local companion key.
    local_key: ByteBuf,
    purposes: Vec<KeyPurpose>,
    valid_from: Option<u64>,
    valid_until: Option<u64>,
    passphrase_required: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
enum PendingOperation {
    Sign { data: ByteBuf },
    KeyAgreement { other_public_key: ByteBuf },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
enum ServerState {
    Registering {
        cloud_challenge: ByteBuf,
    },
    SettingUpE2ee {
        registration: RegistrationRecord,
        cloud_nonce: ByteBuf,
    },
    CreatingKeys {
        request: CreateKeyRequest0,
        cloud_challenge: ByteBuf,
    },
    Unlocking {
        key: KeyRecord,
        operation: PendingOperation,
        cloud_nonce: ByteBuf,
    },
}

enum Unlock {
    Granted(KeyRecord, PendingOperation),
    Denied { result: u32, wait_duration_millis: u64 },
}

#[derive(Debug, Default)]
struct PassphraseAttempts {
    failures: u32,
    locked_until: Option<Instant>,
}

struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self {
            cipher: Aes256Gcm::new(&key.into()),
        }
    }

    fn seal<T: Serialize>(&self, value: &T) -> Result<ByteBuf, CloudError> {
        let mut plaintext = Vec::new();
        ciborium::into_writer(value, &mut plaintext)
            .map_err(|e| CloudError::protocol(format!("unable to encode state: {e}")))?;
        let nonce = random_bytes(12);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| CloudError::protocol("unable to seal state"))?;
        Ok(ByteBuf::from([nonce, ciphertext].concat()))
    }

    fn open<T: DeserializeOwned>(&self, blob: &[u8]) -> Result<T, CloudError> {
        if blob.len() < 12 {
            return Err(CloudError::protocol("sealed state too short"));
        }
        let (nonce, ciphertext) = blob.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CloudError::protocol("sealed state was not issued by this server"))?;
        ciborium::from_reader(plaintext.as_slice())
            .map_err(|e| CloudError::protocol(format!("malformed sealed state: {e}")))
    }
}

/// A Cloud Secure Area server.
///
/// Implements [AsyncHttpClient] so a
/// [CloudSecureArea](super::CloudSecureArea) can talk to it in-process.
pub struct CloudSecureAreaServer {
    config: CloudServerConfig,
    sealer: Sealer,
    issuer: SoftwareAttestationIssuer,
    device_authorizer: Arc<dyn AttestationAuthorizer>,
    session_epoch: AtomicU64,
    attempts: Mutex<HashMap<String, PassphraseAttempts>>,
}

impl CloudSecureAreaServer {
    /// `issuer` attests the server's keys. `device_authorizer` decides
    /// which device attestations are trusted.
    pub fn new(
        config: CloudServerConfig,
        issuer: SoftwareAttestationIssuer,
        device_authorizer: Arc<dyn AttestationAuthorizer>,
    ) -> Self {
        Self {
            config,
            sealer: Sealer::generate(),
            issuer,
            device_authorizer,
            session_epoch: AtomicU64::new(0),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn issuer(&self) -> &SoftwareAttestationIssuer {
        &self.issuer
    }

    /// Invalidates every E2EE session. Registrations and keys stay valid.
    pub fn expire_sessions(&self) {
        self.session_epoch.fetch_add(1, Ordering::SeqCst);
        info!("Expired all E2EE sessions");
    }

    /// Handles one request body, returning the status and response body.
    pub fn handle(&self, body: &[u8]) -> (StatusCode, Vec<u8>) {
        match self.dispatch(body).and_then(|response| Ok(response.encode()?)) {
            Ok(body) => (StatusCode::OK, body),
            Err(ServerError::Rekey(reason)) => {
                debug!(reason, "Requesting E2EE re-key");
                (StatusCode::BAD_REQUEST, reason.as_bytes().to_vec())
            }
            Err(ServerError::Cloud(e)) => {
                warn!(error = %e, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string().into_bytes())
            }
        }
    }

    fn dispatch(&self, body: &[u8]) -> Result<Command, ServerError> {
        let command = Command::decode(body)?;
        debug!(command = command.name(), "Handling request");
        match command {
            Command::RegisterRequest0(request) => Ok(self.register0(request)?),
            Command::RegisterRequest1(request) => Ok(self.register1(request)?),
            Command::E2eeSetupRequest0(request) => Ok(self.e2ee_setup0(request)?),
            Command::E2eeSetupRequest1(request) => Ok(self.e2ee_setup1(request)?),
            Command::E2eeRequest(request) => self.e2ee(request),
            other => Err(CloudError::protocol(format!(
                "{} is not accepted outside of E2EE",
                other.name()
            ))
            .into()),
        }
    }

    fn register0(&self, _request: RegisterRequest0) -> Result<Command, CloudError> {
        let cloud_challenge = ByteBuf::from(random_bytes(NONCE_LEN));
        let server_state = self.sealer.seal(&ServerState::Registering {
            cloud_challenge: cloud_challenge.clone(),
        })?;
        Ok(Command::RegisterResponse0(RegisterResponse0 {
            cloud_challenge,
            server_state,
        }))
    }

    fn register1(&self, request: RegisterRequest1) -> Result<Command, CloudError> {
        let ServerState::Registering { cloud_challenge } =
            self.sealer.open::<ServerState>(&request.server_state)?
        else {
            return Err(CloudError::protocol("unexpected server state"));
        };

        for attestation in [
            &request.device_attestation,
            &request.device_binding_key_attestation,
        ] {
            validate_attestation(
                attestation,
                &cloud_challenge,
                self.device_authorizer.as_ref(),
            )?;
        }

        let cloud_binding_key = SigningKey::random(&mut OsRng);
        let cloud_binding_key_attestation = self.issuer.attest(
            &public_key_bytes(&PublicKey::from(cloud_binding_key.verifying_key())),
            &request.device_challenge,
        )?;

        let record = RegistrationRecord {
            id: Uuid::new_v4().to_string(),
            device_attestation_key: request.device_attestation.public_key,
            device_binding_key: request.device_binding_key_attestation.public_key,
            cloud_binding_key: ByteBuf::from(cloud_binding_key.to_bytes().to_vec()),
            passphrase: None,
        };
        info!(registration_id = %record.id, "Registered device");

        Ok(Command::RegisterResponse1(RegisterResponse1 {
            cloud_binding_key_attestation,
            registration_context: self.sealer.seal(&record)?,
        }))
    }

    fn e2ee_setup0(&self, request: E2eeSetupRequest0) -> Result<Command, CloudError> {
        let registration: RegistrationRecord = self.sealer.open(&request.registration_context)?;
        let cloud_nonce = ByteBuf::from(random_bytes(NONCE_LEN));
        let server_state = self.sealer.seal(&ServerState::SettingUpE2ee {
            registration,
            cloud_nonce: cloud_nonce.clone(),
        })?;
        Ok(Command::E2eeSetupResponse0(E2eeSetupResponse0 {
            cloud_nonce,
            server_state,
        }))
    }

    fn e2ee_setup1(&self, request: E2eeSetupRequest1) -> Result<Command, CloudError> {
        let ServerState::SettingUpE2ee {
            registration,
            cloud_nonce,
        } = self.sealer.open::<ServerState>(&request.server_state)?
        else {
            return Err(CloudError::protocol("unexpected server state"));
        };

        let transcript = e2ee_transcript(&request.e_device_key, &cloud_nonce, &request.device_nonce)?;
        if !verify(&registration.device_binding_key, &transcript, &request.signature) {
            return Err(CloudError::attestation("invalid device binding key signature"));
        }
        if !verify(
            &registration.device_attestation_key,
            &cloud_nonce,
            &request.device_assertion,
        ) {
            return Err(CloudError::attestation("invalid device assertion"));
        }

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let e_cloud_key = public_key_bytes(&ephemeral.public_key());
        let shared = ephemeral.diffie_hellman(&parse_public_key(&request.e_device_key)?);
        let keys = SessionKeys::derive(
            shared.raw_secret_bytes().as_slice(),
            &request.device_nonce,
            &cloud_nonce,
        )?;

        let transcript = e2ee_transcript(&e_cloud_key, &cloud_nonce, &request.device_nonce)?;
        let signature = sign(&registration.cloud_binding_key()?, &transcript);

        let record = E2eeRecord {
            epoch: self.session_epoch.load(Ordering::SeqCst),
            registration,
            sk_device: ByteBuf::from(keys.sk_device.to_vec()),
            sk_cloud: ByteBuf::from(keys.sk_cloud.to_vec()),
            device_counter: 1,
            cloud_counter: 1,
        };
        debug!(registration_id = %record.registration.id, "E2EE session established");

        Ok(Command::E2eeSetupResponse1(E2eeSetupResponse1 {
            e_cloud_key: ByteBuf::from(e_cloud_key),
            signature: ByteBuf::from(signature),
            e2ee_context: self.sealer.seal(&record)?,
        }))
    }

    fn e2ee(&self, request: E2eeRequest) -> Result<Command, ServerError> {
        let mut record: E2eeRecord = self
            .sealer
            .open(&request.e2ee_context)
            .map_err(|_| ServerError::Rekey("unknown E2EE context"))?;
        if record.epoch != self.session_epoch.load(Ordering::SeqCst) {
            return Err(ServerError::Rekey("E2EE session expired"));
        }

        let (Some(next_device_counter), Some(next_cloud_counter)) = (
            record.device_counter.checked_add(1),
            record.cloud_counter.checked_add(1),
        ) else {
            return Err(ServerError::Rekey("E2EE counters exhausted"));
        };

        let keys = record.keys()?;
        let plaintext = crypto::decrypt(
            &keys.sk_device,
            Direction::DeviceToCloud,
            record.device_counter,
            &request.encrypted_request,
        )
        .map_err(|_| ServerError::Rekey("unable to decrypt request"))?;
        record.device_counter = next_device_counter;

        let response = self.handle_wrapped(&mut record.registration, Command::decode(&plaintext)?)?;

        let encrypted_response = crypto::encrypt(
            &keys.sk_cloud,
            Direction::CloudToDevice,
            record.cloud_counter,
            &response.encode()?,
        )?;
        record.cloud_counter = next_cloud_counter;

        Ok(Command::E2eeResponse(E2eeResponse {
            encrypted_response: ByteBuf::from(encrypted_response),
            e2ee_context: self.sealer.seal(&record)?,
        }))
    }

    fn handle_wrapped(
        &self,
        registration: &mut RegistrationRecord,
        command: Command,
    ) -> Result<Command, CloudError> {
        debug!(command = command.name(), "Handling E2EE request");
        match command {
            Command::RegisterStage2Request0(request) => {
                if registration.passphrase.is_some() {
                    return Err(CloudError::protocol("passphrase is already set"));
                }
                registration.passphrase = Some(PassphraseDigest::new(&request.passphrase));
                Ok(Command::RegisterStage2Response0(RegisterStage2Response0 {
                    registration_context: self.sealer.seal(registration)?,
                }))
            }
            Command::CreateKeyRequest0(request) => {
                let cloud_challenge = ByteBuf::from(random_bytes(NONCE_LEN));
                let server_state = self.sealer.seal(&ServerState::CreatingKeys {
                    request,
                    cloud_challenge: cloud_challenge.clone(),
                })?;
                Ok(Command::CreateKeyResponse0(CreateKeyResponse0 {
                    cloud_challenge,
                    server_state,
                }))
            }
            Command::CreateKeyRequest1(request) => self.create_keys(registration, request),
            Command::SignRequest0(request) => {
                let (cloud_nonce, server_state) = self.begin_unlock(
                    registration,
                    &request.key_context,
                    KeyPurpose::Sign,
                    PendingOperation::Sign {
                        data: request.data_to_sign,
                    },
                )?;
                Ok(Command::SignResponse0(SignResponse0 {
                    cloud_nonce,
                    server_state,
                }))
            }
            Command::KeyAgreementRequest0(request) => {
                parse_public_key(&request.other_public_key)?;
                let (cloud_nonce, server_state) = self.begin_unlock(
                    registration,
                    &request.key_context,
                    KeyPurpose::KeyAgreement,
                    PendingOperation::KeyAgreement {
                        other_public_key: request.other_public_key,
                    },
                )?;
                Ok(Command::KeyAgreementResponse0(KeyAgreementResponse0 {
                    cloud_nonce,
                    server_state,
                }))
            }
            Command::SignRequest1(request) => {
                let response = match self.unlock(
                    registration,
                    &request.server_state,
                    &request.signature,
                    request.passphrase.as_deref(),
                )? {
                    Unlock::Granted(key, PendingOperation::Sign { data }) => SignResponse1 {
                        result: RESULT_OK,
                        signature: Some(ByteBuf::from(sign(&signing_key(&key.private_key)?, &data))),
                        wait_duration_millis: 0,
                    },
                    Unlock::Granted(..) => {
                        return Err(CloudError::protocol("pending operation is not a signature"))
                    }
                    Unlock::Denied {
                        result,
                        wait_duration_millis,
                    } => SignResponse1 {
                        result,
                        signature: None,
                        wait_duration_millis,
                    },
                };
                Ok(Command::SignResponse1(response))
            }
            Command::KeyAgreementRequest1(request) => {
                let response = match self.unlock(
                    registration,
                    &request.server_state,
                    &request.signature,
                    request.passphrase.as_deref(),
                )? {
                    Unlock::Granted(key, PendingOperation::KeyAgreement { other_public_key }) => {
                        let secret = SecretKey::from_slice(&key.private_key)
                            .map_err(|_| CloudError::protocol("malformed key"))?;
                        let other = parse_public_key(&other_public_key)?;
                        let shared =
                            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), other.as_affine());
                        KeyAgreementResponse1 {
                            result: RESULT_OK,
                            zab: Some(ByteBuf::from(shared.raw_secret_bytes().to_vec())),
                            wait_duration_millis: 0,
                        }
                    }
                    Unlock::Granted(..) => {
                        return Err(CloudError::protocol(
                            "pending operation is not a key agreement",
                        ))
                    }
                    Unlock::Denied {
                        result,
                        wait_duration_millis,
                    } => KeyAgreementResponse1 {
                        result,
                        zab: None,
                        wait_duration_millis,
                    },
                };
                Ok(Command::KeyAgreementResponse1(response))
            }
            Command::CheckPassphraseRequest(request) => {
                let (result, wait_duration_millis) =
                    self.check_passphrase(registration, Some(&request.passphrase))?;
                Ok(Command::CheckPassphraseResponse(CheckPassphraseResponse {
                    result,
                    wait_duration_millis,
                }))
            }
            other => Err(CloudError::protocol(format!(
                "{} is not accepted inside E2EE",
                other.name()
            ))),
        }
    }

    fn create_keys(
        &self,
        registration: &RegistrationRecord,
        request: CreateKeyRequest1,
    ) -> Result<Command, CloudError> {
        let ServerState::CreatingKeys {
            request: settings,
            cloud_challenge,
        } = self.sealer.open::<ServerState>(&request.server_state)?
        else {
            return Err(CloudError::protocol("unexpected server state"));
        };
        if request.local_key_attestations.len() != settings.batch_size as usize {
            return Err(CloudError::protocol(format!(
                "expected {} local keys, got {}",
                settings.batch_size,
                request.local_key_attestations.len()
            )));
        }

        let mut remote_key_attestations = Vec::new();
        let mut key_contexts = Vec::new();
        for local in request.local_key_attestations {
            validate_attestation(&local, &cloud_challenge, self.device_authorizer.as_ref())?;

            let key = SigningKey::random(&mut OsRng);
            let mut attestation = self.issuer.attest(
                &public_key_bytes(&PublicKey::from(key.verifying_key())),
                &settings.challenge,
            )?;
            // The root is sent once as the common intermediate.
            attestation.certificate_chain.truncate(1);
            remote_key_attestations.push(attestation);

            key_contexts.push(self.sealer.seal(&KeyRecord {
                registration_id: registration.id.clone(),
                private_key: ByteBuf::from(key.to_bytes().to_vec()),
                local_key: local.public_key,
                purposes: settings.purposes.clone(),
                valid_from: settings.valid_from,
                valid_until: settings.valid_until,
                passphrase_required: settings.passphrase_required,
            })?);
        }

        let public_keys = remote_key_attestations
            .iter()
            .map(|attestation| ciborium::Value::Bytes(attestation.public_key.to_vec()))
            .collect();
        let batch_attestation = sign(
            &registration.cloud_binding_key()?,
            &cbor_array(public_keys)?,
        );
        info!(
            registration_id = %registration.id,
            count = key_contexts.len(),
            "Created remote keys"
        );

        Ok(Command::CreateKeyResponse1(CreateKeyResponse1 {
            remote_key_attestations,
            key_contexts,
            common_intermediate: Some(ByteBuf::from(self.issuer.root_public_key())),
            batch_attestation: Some(ByteBuf::from(batch_attestation)),
        }))
    }

    fn begin_unlock(
        &self,
        registration: &RegistrationRecord,
        key_context: &[u8],
        purpose: KeyPurpose,
        operation: PendingOperation,
    ) -> Result<(ByteBuf, ByteBuf), CloudError> {
        let key: KeyRecord = self.sealer.open(key_context)?;
        if key.registration_id != registration.id {
            return Err(CloudError::protocol("key belongs to another registration"));
        }
        if !key.purposes.contains(&purpose) {
            return Err(CloudError::protocol(format!(
                "key cannot be used for {purpose:?}"
            )));
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| CloudError::protocol("system clock before Unix epoch"))?
            .as_secs();
        if key.valid_from.is_some_and(|from| now < from)
            || key.valid_until.is_some_and(|until| now > until)
        {
            return Err(CloudError::protocol("key is not valid at this time"));
        }

        let cloud_nonce = ByteBuf::from(random_bytes(NONCE_LEN));
        let server_state = self.sealer.seal(&ServerState::Unlocking {
            key,
            operation,
            cloud_nonce: cloud_nonce.clone(),
        })?;
        Ok((cloud_nonce, server_state))
    }

    fn unlock(
        &self,
        registration: &RegistrationRecord,
        server_state: &[u8],
        signature: &[u8],
        passphrase: Option<&str>,
    ) -> Result<Unlock, CloudError> {
        let ServerState::Unlocking {
            key,
            operation,
            cloud_nonce,
        } = self.sealer.open::<ServerState>(server_state)?
        else {
            return Err(CloudError::protocol("unexpected server state"));
        };
        if !verify(&key.local_key, &cloud_nonce, signature) {
            return Err(CloudError::protocol("invalid local key signature"));
        }

        if key.passphrase_required {
            let (result, wait_duration_millis) = self.check_passphrase(registration, passphrase)?;
            if result != RESULT_OK {
                return Ok(Unlock::Denied {
                    result,
                    wait_duration_millis,
                });
            }
        }
        Ok(Unlock::Granted(key, operation))
    }

    /// Returns the result code and, when locked out, the remaining wait.
    fn check_passphrase(
        &self,
        registration: &RegistrationRecord,
        passphrase: Option<&str>,
    ) -> Result<(u32, u64), CloudError> {
        let Some(digest) = &registration.passphrase else {
            return Err(CloudError::protocol("no passphrase registered"));
        };
        let mut attempts = self
            .attempts
            .lock()
            .map_err(|_| CloudError::protocol("attempt counters poisoned"))?;
        let entry = attempts.entry(registration.id.clone()).or_default();
        let now = Instant::now();

        if let Some(locked_until) = entry.locked_until {
            if locked_until > now {
                let wait = locked_until - now;
                return Ok((RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS, millis(wait)));
            }
            entry.locked_until = None;
        }

        if passphrase.is_some_and(|passphrase| digest.matches(passphrase)) {
            entry.failures = 0;
            return Ok((RESULT_OK, 0));
        }

        entry.failures += 1;
        if entry.failures >= self.config.max_passphrase_attempts {
            warn!(
                registration_id = %registration.id,
                failures = entry.failures,
                "Locking out passphrase attempts"
            );
            entry.failures = 0;
            entry.locked_until =
                Some(now + Duration::from_millis(self.config.passphrase_lockout_ms));
        }
        Ok((RESULT_WRONG_PASSPHRASE, 0))
    }
}

#[async_trait]
impl AsyncHttpClient for CloudSecureAreaServer {
    async fn execute(&self, request: Request<Vec<u8>>) -> anyhow::Result<Response<Vec<u8>>> {
        let (status, body) = self.handle(request.body());
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, CBOR_CONTENT_TYPE)
            .body(body)
            .context("unable to construct response")
    }
}

fn signing_key(bytes: &[u8]) -> Result<SigningKey, CloudError> {
    SigningKey::from_slice(bytes).map_err(|_| CloudError::protocol("malformed key"))
}

use std::{future::Future, sync::Arc, time::Duration};

use http::StatusCode;
use p256::ecdh::EphemeralSecret;
use rand::rngs::OsRng;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use super::{
    attestation::{validate_attestation, AttestationAuthorizer},
    config::CloudSecureAreaConfig,
    crypto::{
        self, e2ee_transcript, parse_public_key, public_key_bytes, random_bytes, verify,
        Direction, SessionKeys, NONCE_LEN,
    },
    error::{CloudError, KeyLockedReason, Result},
    hardware::{LocalKeyPolicy, SecureHardware},
    protocol::{
        expect_response, CheckPassphraseRequest, Command, E2eeRequest, E2eeSetupRequest0,
        E2eeSetupRequest1, RegisterRequest0, RegisterRequest1, RegisterStage2Request0,
        RESULT_OK, RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS, RESULT_WRONG_PASSPHRASE,
    },
    session::{Registration, Session, BINDING_KEY_ALIAS, DEVICE_ATTESTATION_ALIAS},
};
use crate::core::util::{post_request, AsyncHttpClient};

/// Client of a Cloud Secure Area: a remote secure enclave holding private
/// keys, each bound to a companion key in the device's secure hardware.
///
/// A client owns one logical session. Every operation takes `&mut self`
/// since counters and the server's continuation state are consumed and
/// replaced on each exchange.
pub struct CloudSecureArea<H, W> {
    pub(crate) config: CloudSecureAreaConfig,
    http: H,
    pub(crate) hardware: W,
    pub(crate) authorizer: Arc<dyn AttestationAuthorizer>,
    pub(crate) registration: Option<Registration>,
    session: Option<Session>,
}

impl<H, W> CloudSecureArea<H, W>
where
    H: AsyncHttpClient,
    W: SecureHardware,
{
    /// `authorizer` decides which roots the server's attestations may
    /// chain to.
    pub fn new(
        config: CloudSecureAreaConfig,
        http: H,
        hardware: W,
        authorizer: Arc<dyn AttestationAuthorizer>,
    ) -> Self {
        Self {
            config,
            http,
            hardware,
            authorizer,
            registration: None,
            session: None,
        }
    }

    /// Resumes a previously persisted registration.
    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self.session = None;
        self
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// `(encrypted, decrypted)` counters of the current E2EE session.
    pub fn session_counters(&self) -> Option<(u32, u32)> {
        self.session
            .as_ref()
            .map(|session| (session.encrypted_counter, session.decrypted_counter))
    }

    /// Registers with the server and sets the passphrase guarding keys
    /// created with [KeySettings::passphrase_required](super::KeySettings).
    ///
    /// Any previous registration is replaced. Nothing is kept if a step
    /// fails or the operation timeout elapses, local keys included.
    pub async fn register(&mut self, passphrase: &str) -> Result<()> {
        self.config.passphrase_constraints.validate(passphrase)?;
        self.registration = None;
        self.session = None;

        let result =
            with_deadline(self.config.operation_timeout(), self.register_stages(passphrase)).await;
        if let Err(e) = &result {
            warn!(error = %e, "Registration failed, discarding local keys");
            self.registration = None;
            self.session = None;
            for alias in [BINDING_KEY_ALIAS, DEVICE_ATTESTATION_ALIAS] {
                if let Err(e) = self.hardware.delete_key(alias).await {
                    warn!(alias, error = %e, "Unable to delete local key");
                }
            }
        }
        result
    }

    async fn register_stages(&mut self, passphrase: &str) -> Result<()> {
        let response = self
            .round_trip(Command::RegisterRequest0(RegisterRequest0 {
                client_version: self.config.client_version.clone(),
            }))
            .await?;
        let response = expect_response!(response, RegisterResponse0)?;

        let device_challenge = random_bytes(NONCE_LEN);
        let policy = LocalKeyPolicy::default();
        let device_attestation = self
            .hardware
            .create_key(DEVICE_ATTESTATION_ALIAS, &response.cloud_challenge, &policy)
            .await?;
        let device_binding_key_attestation = self
            .hardware
            .create_key(BINDING_KEY_ALIAS, &response.cloud_challenge, &policy)
            .await?;

        let response = self
            .round_trip(Command::RegisterRequest1(RegisterRequest1 {
                device_challenge: ByteBuf::from(device_challenge.clone()),
                device_attestation,
                device_binding_key_attestation,
                server_state: response.server_state,
            }))
            .await?;
        let response = expect_response!(response, RegisterResponse1)?;

        validate_attestation(
            &response.cloud_binding_key_attestation,
            &device_challenge,
            self.authorizer.as_ref(),
        )?;

        self.registration = Some(Registration {
            registration_context: response.registration_context,
            device_attestation_id: DEVICE_ATTESTATION_ALIAS.to_owned(),
            binding_key_alias: BINDING_KEY_ALIAS.to_owned(),
            cloud_binding_key: response.cloud_binding_key_attestation.public_key,
            keys: Default::default(),
        });
        debug!("Registration stage 1 complete");

        let response = self
            .call_e2ee(Command::RegisterStage2Request0(RegisterStage2Request0 {
                passphrase: passphrase.to_owned(),
            }))
            .await?;
        let response = expect_response!(response, RegisterStage2Response0)?;
        self.registration_mut()?.registration_context = response.registration_context;

        info!("Registered with Cloud Secure Area");
        Ok(())
    }

    /// Forgets the registration and deletes every local key it created.
    pub async fn unregister(&mut self) -> Result<()> {
        let Some(registration) = self.registration.take() else {
            return Ok(());
        };
        self.session = None;

        for metadata in registration.keys.values() {
            self.hardware.delete_key(&metadata.local_key_alias()).await?;
        }
        self.hardware
            .delete_key(&registration.binding_key_alias)
            .await?;
        self.hardware
            .delete_key(&registration.device_attestation_id)
            .await?;

        info!("Unregistered from Cloud Secure Area");
        Ok(())
    }

    /// Checks `passphrase` without using a key. Failures count towards the
    /// server's brute-force limit like any other.
    pub async fn check_passphrase(&mut self, passphrase: &str) -> Result<()> {
        let request = Command::CheckPassphraseRequest(CheckPassphraseRequest {
            passphrase: passphrase.to_owned(),
        });
        let result = with_deadline(self.config.operation_timeout(), async {
            let response = self.call_e2ee(request).await?;
            expect_response!(response, CheckPassphraseResponse)
        })
        .await;
        let response = self.settle(result)?;

        match response.result {
            RESULT_OK => Ok(()),
            RESULT_WRONG_PASSPHRASE => Err(CloudError::KeyLocked(KeyLockedReason::WrongPassphrase)),
            RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS => {
                Err(CloudError::KeyLocked(KeyLockedReason::TooManyAttempts {
                    wait: Duration::from_millis(response.wait_duration_millis),
                }))
            }
            other => Err(CloudError::protocol(format!("unknown result code {other}"))),
        }
    }

    pub(crate) fn registration_mut(&mut self) -> Result<&mut Registration> {
        self.registration.as_mut().ok_or(CloudError::NotRegistered)
    }

    /// Drops the session if the operation timed out mid-exchange.
    pub(crate) fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(CloudError::Timeout(_))) {
            warn!("Operation timed out, dropping E2EE session");
            self.session = None;
        }
        result
    }

    /// Sends `request` inside the E2EE session, setting one up first if
    /// needed.
    ///
    /// A 400 from the server means it could not decrypt the request and
    /// wants a new session. The request is then re-sent over a fresh
    /// session, at most `max_rekey_attempts` setups per call.
    pub(crate) async fn call_e2ee(&mut self, request: Command) -> Result<Command> {
        let plaintext = request.encode()?;
        let mut setups = 0;

        loop {
            if self.session.is_none() {
                if setups >= self.config.max_rekey_attempts {
                    warn!(setups, "Giving up on E2EE session setup");
                    return Err(CloudError::RekeyLimitExceeded(setups));
                }
                setups += 1;
                self.setup_e2ee().await?;
            }

            let envelope = {
                let session = self.session.as_mut().ok_or(CloudError::NotRegistered)?;
                let Some(next_counter) = session.encrypted_counter.checked_add(1) else {
                    warn!("E2EE request counter exhausted, setting up a new session");
                    self.session = None;
                    continue;
                };
                let encrypted_request = crypto::encrypt(
                    session.keys.key(Direction::DeviceToCloud),
                    Direction::DeviceToCloud,
                    session.encrypted_counter,
                    &plaintext,
                )?;
                session.encrypted_counter = next_counter;
                Command::E2eeRequest(E2eeRequest {
                    encrypted_request: ByteBuf::from(encrypted_request),
                    e2ee_context: session.e2ee_context.clone(),
                })
            };

            let (status, body) = match self.post(&envelope).await {
                Ok(response) => response,
                Err(e) => {
                    self.session = None;
                    return Err(e);
                }
            };
            if status == StatusCode::BAD_REQUEST {
                debug!(command = request.name(), "Server requested a new E2EE session");
                self.session = None;
                continue;
            }

            let result = self.open_response(status, &body);
            if result.is_err() {
                self.session = None;
            }
            return result;
        }
    }

    fn open_response(&mut self, status: StatusCode, body: &[u8]) -> Result<Command> {
        let response = expect_response!(decode_ok(status, body)?, E2eeResponse)?;
        let session = self.session.as_mut().ok_or(CloudError::NotRegistered)?;
        let next_counter = session
            .decrypted_counter
            .checked_add(1)
            .ok_or_else(|| CloudError::protocol("E2EE response counter exhausted"))?;

        let plaintext = crypto::decrypt(
            session.keys.key(Direction::CloudToDevice),
            Direction::CloudToDevice,
            session.decrypted_counter,
            &response.encrypted_response,
        )?;
        session.decrypted_counter = next_counter;
        session.e2ee_context = response.e2ee_context;

        Command::decode(&plaintext)
    }

    async fn setup_e2ee(&mut self) -> Result<()> {
        let registration = self.registration.as_ref().ok_or(CloudError::NotRegistered)?;

        let response = self
            .round_trip(Command::E2eeSetupRequest0(E2eeSetupRequest0 {
                registration_context: registration.registration_context.clone(),
            }))
            .await?;
        let response = expect_response!(response, E2eeSetupResponse0)?;
        let cloud_nonce = response.cloud_nonce;

        let ephemeral = EphemeralSecret::random(&mut OsRng);
        let e_device_key = public_key_bytes(&ephemeral.public_key());
        let device_nonce = random_bytes(NONCE_LEN);

        let transcript = e2ee_transcript(&e_device_key, &cloud_nonce, &device_nonce)?;
        let signature = self
            .hardware
            .sign(&registration.binding_key_alias, &transcript)
            .await?;
        let device_assertion = self
            .hardware
            .sign(&registration.device_attestation_id, &cloud_nonce)
            .await?;

        let response = self
            .round_trip(Command::E2eeSetupRequest1(E2eeSetupRequest1 {
                e_device_key: ByteBuf::from(e_device_key),
                device_nonce: ByteBuf::from(device_nonce.clone()),
                signature: ByteBuf::from(signature),
                device_assertion: ByteBuf::from(device_assertion),
                server_state: response.server_state,
            }))
            .await?;
        let response = expect_response!(response, E2eeSetupResponse1)?;

        let transcript = e2ee_transcript(&response.e_cloud_key, &cloud_nonce, &device_nonce)?;
        if !verify(
            &registration.cloud_binding_key,
            &transcript,
            &response.signature,
        ) {
            return Err(CloudError::attestation(
                "E2EE setup not signed by the cloud binding key",
            ));
        }

        let shared = ephemeral.diffie_hellman(&parse_public_key(&response.e_cloud_key)?);
        let keys = SessionKeys::derive(
            shared.raw_secret_bytes().as_slice(),
            &device_nonce,
            &cloud_nonce,
        )?;

        self.session = Some(Session::new(keys, response.e2ee_context));
        debug!("E2EE session established");
        Ok(())
    }

    /// Unwrapped exchange. Anything but 200 is a protocol error.
    async fn round_trip(&self, request: Command) -> Result<Command> {
        let (status, body) = self.post(&request).await?;
        decode_ok(status, &body)
    }

    async fn post(&self, command: &Command) -> Result<(StatusCode, Vec<u8>)> {
        let request = post_request(self.config.server_url.as_str(), command.encode()?)
            .map_err(CloudError::Transport)?;
        let response = self
            .http
            .execute(request)
            .await
            .map_err(CloudError::Transport)?;
        Ok((response.status(), response.into_body()))
    }
}

fn decode_ok(status: StatusCode, body: &[u8]) -> Result<Command> {
    if status != StatusCode::OK {
        return Err(CloudError::protocol(format!(
            "server returned {status}: {}",
            String::from_utf8_lossy(body)
        )));
    }
    Command::decode(body)
}

/// Runs `operation`, failing with [CloudError::Timeout] once `deadline`
/// elapses.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, operation)
            .await
            .map_err(|_| CloudError::Timeout(deadline))?,
        None => operation.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csa::{
        CloudSecureAreaServer, CloudServerConfig, KeySettings, KeyUnlockData,
        SoftwareAttestationIssuer, SoftwareSecureHardware,
    };
    use url::Url;

    const PASSPHRASE: &str = "1234";

    type Client = CloudSecureArea<Arc<CloudSecureAreaServer>, Arc<SoftwareSecureHardware>>;

    async fn registered() -> Client {
        let hardware = Arc::new(SoftwareSecureHardware::default());
        let server = Arc::new(CloudSecureAreaServer::new(
            CloudServerConfig::default(),
            SoftwareAttestationIssuer::generate(),
            Arc::new(hardware.issuer().authorizer()),
        ));
        let mut csa = CloudSecureArea::new(
            CloudSecureAreaConfig::new(Url::parse("https://csa.example.com/").unwrap()),
            server.clone(),
            hardware,
            Arc::new(server.issuer().authorizer()),
        );
        csa.register(PASSPHRASE).await.unwrap();
        csa
    }

    #[tokio::test]
    async fn exhausted_request_counter_sets_up_a_new_session() {
        let mut csa = registered().await;
        csa.session.as_mut().unwrap().encrypted_counter = u32::MAX;

        csa.check_passphrase(PASSPHRASE).await.unwrap();

        assert_eq!(csa.session_counters(), Some((2, 2)));
    }

    #[tokio::test]
    async fn exhausted_response_counter_drops_the_session() {
        let mut csa = registered().await;
        csa.session.as_mut().unwrap().decrypted_counter = u32::MAX;

        let err = csa.check_passphrase(PASSPHRASE).await.unwrap_err();
        assert!(matches!(err, CloudError::Protocol(_)));
        assert_eq!(csa.session_counters(), None);

        csa.check_passphrase(PASSPHRASE).await.unwrap();
        assert_eq!(csa.session_counters(), Some((2, 2)));
    }

    #[tokio::test]
    async fn passphrase_cannot_be_replaced_after_registration() {
        let mut csa = registered().await;
        csa.create_key("pid", &KeySettings::default().with_passphrase_required(true))
            .await
            .unwrap();

        let replaced = csa
            .call_e2ee(Command::RegisterStage2Request0(RegisterStage2Request0 {
                passphrase: "9999".into(),
            }))
            .await;
        assert!(matches!(replaced, Err(CloudError::Protocol(_))));

        let err = csa
            .sign("pid", b"data", KeyUnlockData::Passphrase("9999".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudError::KeyLocked(KeyLockedReason::WrongPassphrase)
        ));
        csa.sign("pid", b"data", KeyUnlockData::Passphrase(PASSPHRASE.into()))
            .await
            .unwrap();
    }
}

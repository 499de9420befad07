use std::time::Duration;

use async_trait::async_trait;
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn};

use super::{
    attestation::validate_attestation,
    client::{with_deadline, CloudSecureArea},
    config::millis,
    crypto::{cbor_array, random_bytes, verify, NONCE_LEN},
    error::{CloudError, KeyLockedReason, Result},
    hardware::{HardwareError, LocalKeyPolicy, SecureHardware},
    protocol::{
        expect_response, Command, CreateKeyRequest0, CreateKeyRequest1, KeyAgreementRequest0,
        KeyAgreementRequest1, KeyPurpose, SignRequest0, SignRequest1, UserAuthType, RESULT_OK,
        RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS, RESULT_WRONG_PASSPHRASE,
    },
    session::{companion_key_alias, KeyMetadata},
};
use crate::core::util::AsyncHttpClient;

/// Policy of a remote key to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySettings {
    pub purposes: Vec<KeyPurpose>,
    /// Seconds since the Unix epoch.
    pub valid_from: Option<u64>,
    pub valid_until: Option<u64>,
    pub passphrase_required: bool,
    pub user_authentication_required: bool,
    pub user_authentication_types: Vec<UserAuthType>,
    /// Challenge for the remote key attestation. Random if unset.
    pub attestation_challenge: Option<Vec<u8>>,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self {
            purposes: vec![KeyPurpose::Sign],
            valid_from: None,
            valid_until: None,
            passphrase_required: false,
            user_authentication_required: false,
            user_authentication_types: Vec::new(),
            attestation_challenge: None,
        }
    }
}

impl KeySettings {
    pub fn new(purposes: Vec<KeyPurpose>) -> Self {
        Self {
            purposes,
            ..Default::default()
        }
    }

    pub fn with_passphrase_required(mut self, required: bool) -> Self {
        self.passphrase_required = required;
        self
    }

    pub fn with_user_authentication(mut self, types: Vec<UserAuthType>) -> Self {
        self.user_authentication_required = !types.is_empty();
        self.user_authentication_types = types;
        self
    }

    pub fn with_validity(mut self, valid_from: u64, valid_until: u64) -> Self {
        self.valid_from = Some(valid_from);
        self.valid_until = Some(valid_until);
        self
    }
}

/// Asks the user for the passphrase.
#[async_trait]
pub trait PassphrasePrompt: Send + Sync {
    /// `reason` explains why a previous attempt failed. Returns `None` if
    /// the user canceled.
    async fn request_passphrase(&self, reason: Option<KeyLockedReason>) -> Option<String>;
}

/// How to unlock a passphrase protected key.
pub enum KeyUnlockData<'a> {
    None,
    Passphrase(String),
    /// Prompt the user, again after every wrong passphrase, until they
    /// get it right or cancel.
    Interactive(&'a dyn PassphrasePrompt),
}

enum Operation<'a> {
    Sign(&'a [u8]),
    KeyAgreement(&'a [u8]),
}

enum Outcome {
    Done(Vec<u8>),
    Denied { result: u32, wait: Duration },
}

impl<H, W> CloudSecureArea<H, W>
where
    H: AsyncHttpClient,
    W: SecureHardware,
{
    pub async fn create_key(&mut self, alias: &str, settings: &KeySettings) -> Result<KeyMetadata> {
        self.batch_create_keys(&[alias], settings)
            .await?
            .pop()
            .ok_or_else(|| CloudError::protocol("server created no key"))
    }

    /// Creates one remote key per alias in a single round trip. Existing
    /// keys with the same alias are replaced.
    pub async fn batch_create_keys(
        &mut self,
        aliases: &[&str],
        settings: &KeySettings,
    ) -> Result<Vec<KeyMetadata>> {
        let result = with_deadline(
            self.config.operation_timeout(),
            self.create_keys(aliases, settings),
        )
        .await;
        self.settle(result)
    }

    async fn create_keys(
        &mut self,
        aliases: &[&str],
        settings: &KeySettings,
    ) -> Result<Vec<KeyMetadata>> {
        let challenge = settings
            .attestation_challenge
            .clone()
            .unwrap_or_else(|| random_bytes(NONCE_LEN));
        let batch_size = u32::try_from(aliases.len())
            .map_err(|_| CloudError::protocol("batch too large"))?;

        let response = self
            .call_e2ee(Command::CreateKeyRequest0(CreateKeyRequest0 {
                purposes: settings.purposes.clone(),
                valid_from: settings.valid_from,
                valid_until: settings.valid_until,
                passphrase_required: settings.passphrase_required,
                user_authentication_required: settings.user_authentication_required,
                user_authentication_types: settings.user_authentication_types.clone(),
                challenge: ByteBuf::from(challenge.clone()),
                batch_size,
            }))
            .await?;
        let response = expect_response!(response, CreateKeyResponse0)?;

        let policy = LocalKeyPolicy {
            user_authentication_required: settings.user_authentication_required,
            user_authentication_types: settings.user_authentication_types.clone(),
        };
        let mut local_key_attestations = Vec::with_capacity(aliases.len());
        for alias in aliases {
            local_key_attestations.push(
                self.hardware
                    .create_key(
                        &companion_key_alias(alias),
                        &response.cloud_challenge,
                        &policy,
                    )
                    .await?,
            );
        }

        let response = self
            .call_e2ee(Command::CreateKeyRequest1(CreateKeyRequest1 {
                local_key_attestations,
                server_state: response.server_state,
            }))
            .await?;
        let response = expect_response!(response, CreateKeyResponse1)?;

        if response.remote_key_attestations.len() != aliases.len()
            || response.key_contexts.len() != aliases.len()
        {
            return Err(CloudError::protocol(format!(
                "asked for {} keys, got {}",
                aliases.len(),
                response.remote_key_attestations.len()
            )));
        }

        let registration = self.registration_mut()?;
        if let Some(batch_attestation) = &response.batch_attestation {
            let public_keys = response
                .remote_key_attestations
                .iter()
                .map(|attestation| ciborium::Value::Bytes(attestation.public_key.to_vec()))
                .collect();
            if !verify(
                &registration.cloud_binding_key,
                &cbor_array(public_keys)?,
                batch_attestation,
            ) {
                return Err(CloudError::attestation(
                    "batch not signed by the cloud binding key",
                ));
            }
        }

        let mut created = Vec::with_capacity(aliases.len());
        for ((alias, mut attestation), key_context) in aliases
            .iter()
            .zip(response.remote_key_attestations)
            .zip(response.key_contexts)
        {
            if let Some(intermediate) = &response.common_intermediate {
                attestation.certificate_chain.push(intermediate.clone());
            }
            validate_attestation(&attestation, &challenge, self.authorizer.as_ref())?;

            created.push(KeyMetadata {
                alias: alias.to_string(),
                purposes: settings.purposes.clone(),
                valid_from: settings.valid_from,
                valid_until: settings.valid_until,
                passphrase_required: settings.passphrase_required,
                user_authentication_required: settings.user_authentication_required,
                user_authentication_types: settings.user_authentication_types.clone(),
                attestation,
                key_context,
            });
        }

        let registration = self.registration_mut()?;
        for metadata in &created {
            registration
                .keys
                .insert(metadata.alias.clone(), metadata.clone());
        }
        info!(count = created.len(), "Created remote keys");
        Ok(created)
    }

    pub fn key_info(&self, alias: &str) -> Result<&KeyMetadata> {
        self.registration
            .as_ref()
            .ok_or(CloudError::NotRegistered)?
            .keys
            .get(alias)
            .ok_or_else(|| CloudError::KeyNotFound(alias.to_owned()))
    }

    /// Forgets the key and deletes its local companion key. Without the
    /// companion key the remote key can no longer be used.
    pub async fn delete_key(&mut self, alias: &str) -> Result<()> {
        let metadata = self
            .registration_mut()?
            .keys
            .remove(alias)
            .ok_or_else(|| CloudError::KeyNotFound(alias.to_owned()))?;
        self.hardware
            .delete_key(&metadata.local_key_alias())
            .await?;
        debug!(alias, "Deleted remote key");
        Ok(())
    }

    /// ES256 signature over `data`, raw `r || s`.
    pub async fn sign(
        &mut self,
        alias: &str,
        data: &[u8],
        unlock: KeyUnlockData<'_>,
    ) -> Result<Vec<u8>> {
        let result = with_deadline(
            self.config.operation_timeout(),
            self.use_key(alias, Operation::Sign(data), unlock),
        )
        .await;
        self.settle(result)
    }

    /// ECDH with the SEC1-encoded `other_public_key`. Returns the shared
    /// secret.
    pub async fn key_agreement(
        &mut self,
        alias: &str,
        other_public_key: &[u8],
        unlock: KeyUnlockData<'_>,
    ) -> Result<Vec<u8>> {
        let result = with_deadline(
            self.config.operation_timeout(),
            self.use_key(alias, Operation::KeyAgreement(other_public_key), unlock),
        )
        .await;
        self.settle(result)
    }

    async fn use_key(
        &mut self,
        alias: &str,
        operation: Operation<'_>,
        unlock: KeyUnlockData<'_>,
    ) -> Result<Vec<u8>> {
        let metadata = self.key_info(alias)?.clone();

        let mut passphrase = match &unlock {
            KeyUnlockData::Passphrase(passphrase) => Some(passphrase.clone()),
            KeyUnlockData::Interactive(prompt) if metadata.passphrase_required => {
                Some(prompted(*prompt, None).await?)
            }
            _ => None,
        };
        if metadata.passphrase_required && passphrase.is_none() {
            return Err(CloudError::KeyLocked(KeyLockedReason::WrongPassphrase));
        }

        loop {
            match self
                .attempt(&metadata, &operation, passphrase.as_deref())
                .await?
            {
                Outcome::Done(result) => return Ok(result),
                Outcome::Denied {
                    result: RESULT_TOO_MANY_PASSPHRASE_ATTEMPTS,
                    wait,
                } => {
                    warn!(
                        alias,
                        wait_ms = millis(wait),
                        "Too many passphrase attempts, backing off"
                    );
                    tokio::time::sleep(wait).await;
                }
                Outcome::Denied {
                    result: RESULT_WRONG_PASSPHRASE,
                    ..
                } => match &unlock {
                    KeyUnlockData::Interactive(prompt) => {
                        debug!(alias, "Wrong passphrase, prompting again");
                        passphrase = Some(
                            prompted(*prompt, Some(KeyLockedReason::WrongPassphrase)).await?,
                        );
                    }
                    _ => return Err(CloudError::KeyLocked(KeyLockedReason::WrongPassphrase)),
                },
                Outcome::Denied { result, .. } => {
                    return Err(CloudError::protocol(format!("unknown result code {result}")))
                }
            }
        }
    }

    /// Runs both phases of one sign or key agreement exchange.
    async fn attempt(
        &mut self,
        metadata: &KeyMetadata,
        operation: &Operation<'_>,
        passphrase: Option<&str>,
    ) -> Result<Outcome> {
        let key_context = metadata.key_context.clone();
        let request = match operation {
            Operation::Sign(data) => Command::SignRequest0(SignRequest0 {
                data_to_sign: ByteBuf::from(data.to_vec()),
                key_context,
            }),
            Operation::KeyAgreement(other_public_key) => {
                Command::KeyAgreementRequest0(KeyAgreementRequest0 {
                    other_public_key: ByteBuf::from(other_public_key.to_vec()),
                    key_context,
                })
            }
        };
        let (cloud_nonce, server_state) = match self.call_e2ee(request).await? {
            Command::SignResponse0(response) => (response.cloud_nonce, response.server_state),
            Command::KeyAgreementResponse0(response) => {
                (response.cloud_nonce, response.server_state)
            }
            other => {
                return Err(CloudError::protocol(format!(
                    "unexpected {} for key use",
                    other.name()
                )))
            }
        };

        let signature = self
            .hardware
            .sign(&metadata.local_key_alias(), &cloud_nonce)
            .await
            .map_err(|e| match e {
                HardwareError::UserNotAuthenticated => {
                    CloudError::KeyLocked(KeyLockedReason::UserNotAuthenticated)
                }
                other => CloudError::Hardware(other),
            })?;
        let signature = ByteBuf::from(signature);
        let passphrase = passphrase.map(str::to_owned);

        let (result, value, wait_duration_millis) = match operation {
            Operation::Sign(_) => {
                let response = self
                    .call_e2ee(Command::SignRequest1(SignRequest1 {
                        signature,
                        passphrase,
                        server_state,
                    }))
                    .await?;
                let response = expect_response!(response, SignResponse1)?;
                (response.result, response.signature, response.wait_duration_millis)
            }
            Operation::KeyAgreement(_) => {
                let response = self
                    .call_e2ee(Command::KeyAgreementRequest1(KeyAgreementRequest1 {
                        signature,
                        passphrase,
                        server_state,
                    }))
                    .await?;
                let response = expect_response!(response, KeyAgreementResponse1)?;
                (response.result, response.zab, response.wait_duration_millis)
            }
        };

        if result != RESULT_OK {
            return Ok(Outcome::Denied {
                result,
                wait: Duration::from_millis(wait_duration_millis),
            });
        }
        value
            .map(|value| Outcome::Done(value.into_vec()))
            .ok_or_else(|| CloudError::protocol("successful response without a result"))
    }
}

async fn prompted(
    prompt: &dyn PassphrasePrompt,
    reason: Option<KeyLockedReason>,
) -> Result<String> {
    prompt
        .request_passphrase(reason)
        .await
        .ok_or(CloudError::KeyLocked(KeyLockedReason::UserCanceled))
}

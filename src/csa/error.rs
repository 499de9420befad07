use std::{fmt, time::Duration};

use super::hardware::HardwareError;

/// Why a key operation could not be authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLockedReason {
    /// The passphrase was wrong. The user may try again.
    WrongPassphrase,
    /// Too many wrong passphrases. Retrying is possible after `wait`.
    TooManyAttempts { wait: Duration },
    /// The local companion key requires user authentication which has not happened.
    UserNotAuthenticated,
    /// The user dismissed the passphrase prompt.
    UserCanceled,
}

impl fmt::Display for KeyLockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongPassphrase => f.write_str("wrong passphrase"),
            Self::TooManyAttempts { wait } => write!(
                f,
                "too many passphrase attempts, retry in {} ms",
                wait.as_millis()
            ),
            Self::UserNotAuthenticated => f.write_str("user not authenticated"),
            Self::UserCanceled => f.write_str("canceled by user"),
        }
    }
}

/// Errors raised by the Cloud Secure Area client.
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    /// The server or a message violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An attestation did not chain to a trusted root or carried the wrong challenge.
    #[error("attestation validation failed: {0}")]
    AttestationValidation(String),
    /// A response could not be decrypted with the current session keys.
    #[error("unable to decrypt message")]
    Decryption,
    /// The server kept rejecting the session after repeated E2EE setups.
    #[error("E2EE session could not be established after {0} attempts")]
    RekeyLimitExceeded(u32),
    #[error("key is locked: {0}")]
    KeyLocked(KeyLockedReason),
    /// The caller-specified deadline elapsed.
    #[error("operation timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("transport error")]
    Transport(#[source] anyhow::Error),
    #[error("not registered with the Cloud Secure Area")]
    NotRegistered,
    #[error("no key with alias '{0}'")]
    KeyNotFound(String),
    /// The passphrase does not meet the configured constraints.
    #[error("invalid passphrase: {0}")]
    InvalidPassphrase(String),
    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl CloudError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }

    pub(crate) fn attestation(reason: impl Into<String>) -> Self {
        Self::AttestationValidation(reason.into())
    }
}

pub type Result<T, E = CloudError> = std::result::Result<T, E>;

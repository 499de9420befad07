use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::error::CloudError;

/// Client settings for a Cloud Secure Area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudSecureAreaConfig {
    pub server_url: Url,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// How many E2EE setups a single operation may trigger before giving up.
    #[serde(default = "default_max_rekey_attempts")]
    pub max_rekey_attempts: u32,
    /// Deadline for a whole operation, including passphrase back-off.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default)]
    pub passphrase_constraints: PassphraseConstraints,
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_owned()
}

fn default_max_rekey_attempts() -> u32 {
    10
}

impl CloudSecureAreaConfig {
    pub fn new(server_url: Url) -> Self {
        Self {
            server_url,
            client_version: default_client_version(),
            max_rekey_attempts: default_max_rekey_attempts(),
            operation_timeout_ms: None,
            passphrase_constraints: PassphraseConstraints::default(),
        }
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }
}

/// Rules a passphrase must satisfy before registration sends it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PassphraseConstraints {
    pub min_length: usize,
    pub max_length: usize,
    /// Only digits are allowed.
    pub require_numerical: bool,
}

impl Default for PassphraseConstraints {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 64,
            require_numerical: false,
        }
    }
}

impl PassphraseConstraints {
    /// A PIN of exactly `length` digits.
    pub fn pin(length: usize) -> Self {
        Self {
            min_length: length,
            max_length: length,
            require_numerical: true,
        }
    }

    pub fn validate(&self, passphrase: &str) -> Result<(), CloudError> {
        let length = passphrase.chars().count();
        if length < self.min_length {
            return Err(CloudError::InvalidPassphrase(format!(
                "must be at least {} characters",
                self.min_length
            )));
        }
        if length > self.max_length {
            return Err(CloudError::InvalidPassphrase(format!(
                "must be at most {} characters",
                self.max_length
            )));
        }
        if self.require_numerical && !passphrase.chars().all(|c| c.is_ascii_digit()) {
            return Err(CloudError::InvalidPassphrase("must only contain digits".into()));
        }
        Ok(())
    }
}

/// Settings of the reference [CloudSecureAreaServer](super::CloudSecureAreaServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudServerConfig {
    /// Wrong passphrases tolerated before a lockout.
    pub max_passphrase_attempts: u32,
    pub passphrase_lockout_ms: u64,
}

impl Default for CloudServerConfig {
    fn default() -> Self {
        Self {
            max_passphrase_attempts: 3,
            passphrase_lockout_ms: 30_000,
        }
    }
}

/// Milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: CloudSecureAreaConfig = serde_json::from_value(json!({
            "serverUrl": "https://csa.example.com/api",
            "operationTimeoutMs": 5000
        }))
        .unwrap();

        assert_eq!(config.server_url.host_str(), Some("csa.example.com"));
        assert_eq!(config.max_rekey_attempts, 10);
        assert_eq!(config.operation_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.passphrase_constraints, PassphraseConstraints::default());
    }

    #[test]
    fn pin_constraints() {
        let pin = PassphraseConstraints::pin(6);
        pin.validate("123456").unwrap();
        assert!(pin.validate("12345").is_err());
        assert!(pin.validate("1234567").is_err());
        assert!(matches!(
            pin.validate("12345a"),
            Err(CloudError::InvalidPassphrase(_))
        ));
    }

    #[test]
    fn millis_saturate() {
        assert_eq!(millis(Duration::from_millis(4_000)), 4_000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}

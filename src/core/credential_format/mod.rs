use core::fmt;
use std::{borrow::Cow, str::FromStr};

use serde::{Deserialize, Serialize};

const FORMAT_MSO_MDOC: &str = "mso_mdoc";
const FORMAT_MSO_MDOC_ZK: &str = "mso_mdoc_zk";
const FORMAT_DC_SD_JWT: &str = "dc+sd-jwt";

/// The credential format requested by a DCQL credential query.
///
/// See [OID4VP 1.0 Appendix B](https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#appendix-B)
/// for the registered identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClaimFormatDesignation {
    /// ISO/IEC 18013-5 mobile document, presented with a device-signed MSO.
    MsoMDoc,

    /// ISO/IEC 18013-5 mobile document presented as a zero-knowledge proof.
    /// Matched against the same stored mdoc credentials as [`Self::MsoMDoc`].
    MsoMDocZk,

    /// IETF SD-JWT Verifiable Credential.
    DcSdJwt,

    /// Other format identifiers. Parsed so that the document can be read,
    /// rejected when a query is validated.
    Other(String),
}

impl ClaimFormatDesignation {
    pub fn from_name(name: Cow<str>) -> Self {
        match name.as_ref() {
            FORMAT_MSO_MDOC => Self::MsoMDoc,
            FORMAT_MSO_MDOC_ZK => Self::MsoMDocZk,
            FORMAT_DC_SD_JWT => Self::DcSdJwt,
            _ => Self::Other(name.into_owned()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::MsoMDoc => FORMAT_MSO_MDOC,
            Self::MsoMDocZk => FORMAT_MSO_MDOC_ZK,
            Self::DcSdJwt => FORMAT_DC_SD_JWT,
            Self::Other(other) => other,
        }
    }

    /// Whether credentials of this format are ISO mdocs.
    pub fn is_mdoc(&self) -> bool {
        matches!(self, Self::MsoMDoc | Self::MsoMDocZk)
    }
}

impl From<&str> for ClaimFormatDesignation {
    fn from(s: &str) -> Self {
        Self::from_name(Cow::Borrowed(s))
    }
}

impl From<String> for ClaimFormatDesignation {
    fn from(value: String) -> Self {
        Self::from_name(Cow::Owned(value))
    }
}

impl FromStr for ClaimFormatDesignation {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.into())
    }
}

impl From<ClaimFormatDesignation> for String {
    fn from(format: ClaimFormatDesignation) -> Self {
        match format {
            ClaimFormatDesignation::Other(other) => other,
            known => known.name().to_owned(),
        }
    }
}

impl fmt::Display for ClaimFormatDesignation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name().fmt(f)
    }
}

impl Serialize for ClaimFormatDesignation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.name().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClaimFormatDesignation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Into::into)
    }
}

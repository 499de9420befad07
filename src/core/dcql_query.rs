//! Serde representation of a DCQL query document.
//!
//! These types mirror the JSON shape of the query as sent by a verifier and
//! perform no cross-field validation. [`crate::dcql::Query`] is the validated
//! form the resolver executes.

use crate::{core::credential_format::ClaimFormatDesignation, utils::NonEmptyVec};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlQuery {
    credentials: NonEmptyVec<DcqlCredentialQuery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_sets: Option<NonEmptyVec<DcqlCredentialSetQuery>>,
}

impl DcqlQuery {
    pub fn credentials(&self) -> &[DcqlCredentialQuery] {
        &self.credentials
    }

    pub fn credential_sets(&self) -> Option<&NonEmptyVec<DcqlCredentialSetQuery>> {
        self.credential_sets.as_ref()
    }
}

impl TryFrom<Json> for DcqlQuery {
    type Error = serde_json::Error;

    fn try_from(value: Json) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

/// A Credential Query object
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.1>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlCredentialQuery {
    /// A string identifying the Credential in the response.
    /// Unique within a DCQL query.
    id: String,

    /// The requested format of the Credential.
    format: ClaimFormatDesignation,

    /// Format-specific constraints: `doctype_value` for mdoc formats,
    /// `vct_values` for SD-JWT VC.
    #[serde(default)]
    meta: serde_json::Map<String, Json>,

    #[serde(skip_serializing_if = "Option::is_none")]
    claims: Option<NonEmptyVec<DcqlCredentialClaimsQuery>>,

    /// Alternative combinations of claim identifiers, in order of preference.
    #[serde(skip_serializing_if = "Option::is_none")]
    claim_sets: Option<NonEmptyVec<Vec<String>>>,
}

impl DcqlCredentialQuery {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &ClaimFormatDesignation {
        &self.format
    }

    pub fn meta(&self) -> &serde_json::Map<String, Json> {
        &self.meta
    }

    pub fn claims(&self) -> Option<&NonEmptyVec<DcqlCredentialClaimsQuery>> {
        self.claims.as_ref()
    }

    pub fn claim_sets(&self) -> Option<&NonEmptyVec<Vec<String>>> {
        self.claim_sets.as_ref()
    }
}

/// A Credential Set Query object
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.2>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlCredentialSetQuery {
    /// Each value lists the Credential Query identifiers that together
    /// satisfy the use case.
    options: NonEmptyVec<Vec<String>>,
    /// Defaults to `true` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<bool>,
}

impl DcqlCredentialSetQuery {
    pub fn options(&self) -> &NonEmptyVec<Vec<String>> {
        &self.options
    }

    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(true)
    }
}

/// A Claims Query object
/// See: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#section-6.3>
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DcqlCredentialClaimsQuery {
    /// Required when the owning credential query has `claim_sets`.
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    /// Claims path pointer. For mdoc formats: `[namespace, element_identifier]`.
    path: NonEmptyVec<DcqlCredentialClaimsQueryPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<NonEmptyVec<DcqlCredentialClaimsQueryValue>>,
    /// mdoc only. ISO 18013-5 `IntentToRetain`.
    #[serde(skip_serializing_if = "Option::is_none")]
    intent_to_retain: Option<bool>,
}

impl DcqlCredentialClaimsQuery {
    pub fn id(&self) -> Option<&String> {
        self.id.as_ref()
    }

    pub fn path(&self) -> &[DcqlCredentialClaimsQueryPath] {
        &self.path
    }

    pub fn values(&self) -> Option<&NonEmptyVec<DcqlCredentialClaimsQueryValue>> {
        self.values.as_ref()
    }

    pub fn intent_to_retain(&self) -> Option<bool> {
        self.intent_to_retain
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DcqlCredentialClaimsQueryValue {
    String(String),
    Integer(i64),
    Boolean(bool),
}

impl From<&DcqlCredentialClaimsQueryValue> for Json {
    fn from(value: &DcqlCredentialClaimsQueryValue) -> Self {
        match value {
            DcqlCredentialClaimsQueryValue::String(s) => Json::String(s.clone()),
            DcqlCredentialClaimsQueryValue::Integer(i) => Json::from(*i),
            DcqlCredentialClaimsQueryValue::Boolean(b) => Json::Bool(*b),
        }
    }
}

/// One segment of a claims path pointer. `Null` selects every element of an array.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum DcqlCredentialClaimsQueryPath {
    String(String),
    Null,
    Integer(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn de_serialize_dcql_query() {
        let dcql_query_json = json!({
          "credentials": [
            {
              "id": "0",
              "format": "mso_mdoc",
              "meta": {
                "doctype_value": "org.iso.18013.5.1.mDL"
              },
              "claims": [
                {
                  "path": [
                    "org.iso.18013.5.1",
                    "given_name"
                  ],
                  "intent_to_retain": false
                },
              ]
            }
          ],
          "credential_sets": [
            {
              "options": [["0"]]
            }
          ]
        });
        let dcql_query: DcqlQuery = serde_json::from_value(dcql_query_json.clone()).unwrap();

        let credential = &dcql_query.credentials()[0];
        assert_eq!(credential.id(), "0");
        assert_eq!(credential.format(), &ClaimFormatDesignation::MsoMDoc);
        assert_eq!(
            credential.meta().get("doctype_value"),
            Some(&json!("org.iso.18013.5.1.mDL"))
        );
        let claim = &credential.claims().unwrap()[0];
        assert_eq!(claim.id(), None);
        assert_eq!(claim.intent_to_retain(), Some(false));
        assert!(credential.claim_sets().is_none());
        let sets = dcql_query.credential_sets().unwrap();
        assert_eq!(sets[0].options()[0], vec!["0".to_string()]);

        assert_eq!(dcql_query_json, serde_json::to_value(&dcql_query).unwrap());
    }

    #[test]
    fn dcql_credential_set_query_defaults() {
        let cred_set: DcqlCredentialSetQuery =
            serde_json::from_value(json!({ "options": [["cred1"]] })).unwrap();
        assert!(cred_set.is_required());

        let cred_set: DcqlCredentialSetQuery = serde_json::from_value(json!({
            "options": [["cred1"]],
            "required": false
        }))
        .unwrap();
        assert!(!cred_set.is_required());
    }

    #[test]
    fn claim_paths_accept_indices_and_wildcards() {
        let claim: DcqlCredentialClaimsQuery = serde_json::from_value(json!({
            "id": "n",
            "path": ["nationalities", null, 0],
            "values": ["DE", 7, true]
        }))
        .unwrap();

        assert_eq!(
            claim.path(),
            &[
                DcqlCredentialClaimsQueryPath::String("nationalities".into()),
                DcqlCredentialClaimsQueryPath::Null,
                DcqlCredentialClaimsQueryPath::Integer(0),
            ]
        );
        let values: Vec<Json> = claim.values().unwrap().iter().map(Json::from).collect();
        assert_eq!(values, vec![json!("DE"), json!(7), json!(true)]);
    }

    #[test]
    fn empty_credentials_are_rejected() {
        assert!(DcqlQuery::try_from(json!({ "credentials": [] })).is_err());
    }
}

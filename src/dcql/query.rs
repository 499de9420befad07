use std::collections::{BTreeMap, HashSet};

use serde_json::Value as Json;

use super::{claim::RequestedClaim, DcqlError};
use crate::core::{
    credential_format::ClaimFormatDesignation,
    dcql_query::{DcqlCredentialClaimsQuery, DcqlCredentialClaimsQueryPath, DcqlCredentialQuery, DcqlQuery},
};

/// The format-specific constraint a stored credential must meet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSelector {
    /// ISO mdoc document type, compared for equality.
    Mdoc { doctype: String },
    /// SD-JWT VC types, one of which must equal the credential's `vct`.
    SdJwt { vct_values: Vec<String> },
}

/// One acceptable combination of claims, by claim identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSet(Vec<String>);

impl ClaimSet {
    pub fn claim_ids(&self) -> &[String] {
        &self.0
    }
}

/// A validated credential query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialQuery {
    id: String,
    format: ClaimFormatDesignation,
    selector: CredentialSelector,
    claims: Vec<RequestedClaim>,
    claim_sets: Vec<ClaimSet>,
    claim_ids: BTreeMap<String, usize>,
}

impl CredentialQuery {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> &ClaimFormatDesignation {
        &self.format
    }

    pub fn selector(&self) -> &CredentialSelector {
        &self.selector
    }

    pub fn claims(&self) -> &[RequestedClaim] {
        &self.claims
    }

    /// Alternatives tried in order. Empty means every claim is required.
    pub fn claim_sets(&self) -> &[ClaimSet] {
        &self.claim_sets
    }

    /// Looks up a requested claim by its identifier.
    pub fn claim_by_id(&self, id: &str) -> Option<&RequestedClaim> {
        self.claim_ids.get(id).map(|index| &self.claims[*index])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSetQuery {
    required: bool,
    options: Vec<Vec<String>>,
}

impl CredentialSetQuery {
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Each option lists the credential query identifiers that together satisfy the set.
    pub fn options(&self) -> &[Vec<String>] {
        &self.options
    }
}

/// A validated DCQL query.
///
/// When no credential sets are declared every credential query is
/// implicitly a required set with a single option naming only itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    credential_queries: Vec<CredentialQuery>,
    credential_set_queries: Vec<CredentialSetQuery>,
}

impl Query {
    /// Parses and validates a DCQL query document.
    pub fn from_json(value: Json) -> Result<Self, DcqlError> {
        let dcql = DcqlQuery::try_from(value).map_err(|e| DcqlError::structural(e.to_string()))?;
        Self::try_from(&dcql)
    }

    pub fn credential_queries(&self) -> &[CredentialQuery] {
        &self.credential_queries
    }

    pub fn credential_set_queries(&self) -> &[CredentialSetQuery] {
        &self.credential_set_queries
    }

    pub fn credential_query(&self, id: &str) -> Option<&CredentialQuery> {
        self.credential_queries.iter().find(|query| query.id == id)
    }
}

impl TryFrom<&DcqlQuery> for Query {
    type Error = DcqlError;

    fn try_from(dcql: &DcqlQuery) -> Result<Self, DcqlError> {
        let mut seen = HashSet::new();
        let mut credential_queries = Vec::with_capacity(dcql.credentials().len());
        for credential in dcql.credentials() {
            if !seen.insert(credential.id()) {
                return Err(DcqlError::structural(format!(
                    "duplicate credential query id '{}'",
                    credential.id()
                )));
            }
            credential_queries.push(parse_credential_query(credential)?);
        }

        let credential_set_queries = dcql
            .credential_sets()
            .map(|sets| {
                sets.iter()
                    .map(|set| {
                        let options = set.options().to_vec();
                        for option in &options {
                            if option.is_empty() {
                                return Err(DcqlError::structural("empty credential set option"));
                            }
                            if let Some(unknown) = option.iter().find(|id| !seen.contains(id.as_str())) {
                                return Err(DcqlError::structural(format!(
                                    "credential set references unknown credential query '{unknown}'"
                                )));
                            }
                        }
                        Ok(CredentialSetQuery {
                            required: set.is_required(),
                            options,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            credential_queries,
            credential_set_queries,
        })
    }
}

fn parse_credential_query(credential: &DcqlCredentialQuery) -> Result<CredentialQuery, DcqlError> {
    let id = credential.id();
    let format = credential.format().clone();
    let meta = credential.meta();

    let selector = match &format {
        ClaimFormatDesignation::MsoMDoc | ClaimFormatDesignation::MsoMDocZk => {
            let doctype = meta
                .get("doctype_value")
                .ok_or_else(|| {
                    DcqlError::structural(format!("credential query '{id}' is missing doctype_value"))
                })?
                .as_str()
                .ok_or_else(|| {
                    DcqlError::structural(format!(
                        "credential query '{id}' has a non-string doctype_value"
                    ))
                })?;
            CredentialSelector::Mdoc {
                doctype: doctype.to_owned(),
            }
        }
        ClaimFormatDesignation::DcSdJwt => {
            let vct_values = meta
                .get("vct_values")
                .ok_or_else(|| {
                    DcqlError::structural(format!("credential query '{id}' is missing vct_values"))
                })?
                .as_array()
                .and_then(|values| {
                    values
                        .iter()
                        .map(|value| value.as_str().map(ToOwned::to_owned))
                        .collect::<Option<Vec<_>>>()
                })
                .filter(|values| !values.is_empty())
                .ok_or_else(|| {
                    DcqlError::structural(format!(
                        "credential query '{id}' must have a non-empty string array as vct_values"
                    ))
                })?;
            CredentialSelector::SdJwt { vct_values }
        }
        ClaimFormatDesignation::Other(other) => {
            return Err(DcqlError::structural(format!(
                "credential query '{id}' has unsupported format '{other}'"
            )))
        }
    };

    let claims = credential
        .claims()
        .ok_or_else(|| DcqlError::structural(format!("credential query '{id}' has no claims")))?
        .iter()
        .map(|claim| parse_requested_claim(id, &format, claim))
        .collect::<Result<Vec<_>, _>>()?;

    if credential.claim_sets().is_some() && claims.iter().any(|claim| claim.id().is_none()) {
        return Err(DcqlError::structural(format!(
            "credential query '{id}' has claim_sets, so every claim needs an id"
        )));
    }

    let mut claim_ids = BTreeMap::new();
    for (index, claim) in claims.iter().enumerate() {
        if let Some(claim_id) = claim.id() {
            if claim_ids.insert(claim_id.to_owned(), index).is_some() {
                return Err(DcqlError::structural(format!(
                    "credential query '{id}' has duplicate claim id '{claim_id}'"
                )));
            }
        }
    }

    let claim_sets = credential
        .claim_sets()
        .map(|sets| {
            sets.iter()
                .map(|set| {
                    if set.is_empty() {
                        return Err(DcqlError::structural(format!(
                            "credential query '{id}' has an empty claim set"
                        )));
                    }
                    if let Some(unknown) = set.iter().find(|claim_id| !claim_ids.contains_key(*claim_id)) {
                        return Err(DcqlError::structural(format!(
                            "claim set of credential query '{id}' references unknown claim '{unknown}'"
                        )));
                    }
                    Ok(ClaimSet(set.clone()))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(CredentialQuery {
        id: id.to_owned(),
        format,
        selector,
        claims,
        claim_sets,
        claim_ids,
    })
}

fn parse_requested_claim(
    query_id: &str,
    format: &ClaimFormatDesignation,
    claim: &DcqlCredentialClaimsQuery,
) -> Result<RequestedClaim, DcqlError> {
    let id = claim.id().cloned();
    let values = claim
        .values()
        .map(|values| values.iter().map(Json::from).collect());

    if !format.is_mdoc() {
        return Ok(RequestedClaim::Json {
            id,
            path: claim.path().to_vec(),
            values,
        });
    }

    match claim.path() {
        [DcqlCredentialClaimsQueryPath::String(namespace), DcqlCredentialClaimsQueryPath::String(data_element)] => {
            Ok(RequestedClaim::Mdoc {
                id,
                namespace: namespace.clone(),
                data_element: data_element.clone(),
                intent_to_retain: claim.intent_to_retain().unwrap_or(false),
                values,
            })
        }
        _ => Err(DcqlError::structural(format!(
            "mdoc claim paths in credential query '{query_id}' must be [namespace, data_element]"
        ))),
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::core::dcql_query::DcqlCredentialClaimsQueryPath;

/// A single disclosable data element decoded from a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Claim {
    Mdoc {
        namespace: String,
        data_element: String,
        value: Json,
    },
    Json {
        path: Vec<DcqlCredentialClaimsQueryPath>,
        value: Json,
    },
}

impl Claim {
    pub fn value(&self) -> &Json {
        match self {
            Claim::Mdoc { value, .. } | Claim::Json { value, .. } => value,
        }
    }
}

/// A claim requested by a credential query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestedClaim {
    Mdoc {
        id: Option<String>,
        namespace: String,
        data_element: String,
        intent_to_retain: bool,
        values: Option<Vec<Json>>,
    },
    Json {
        id: Option<String>,
        path: Vec<DcqlCredentialClaimsQueryPath>,
        values: Option<Vec<Json>>,
    },
}

impl RequestedClaim {
    /// The identifier used by claim sets to refer to this claim.
    pub fn id(&self) -> Option<&str> {
        match self {
            RequestedClaim::Mdoc { id, .. } | RequestedClaim::Json { id, .. } => id.as_deref(),
        }
    }

    /// Allowed values, if the verifier restricted them.
    pub fn values(&self) -> Option<&[Json]> {
        match self {
            RequestedClaim::Mdoc { values, .. } | RequestedClaim::Json { values, .. } => {
                values.as_deref()
            }
        }
    }

    fn identifies(&self, claim: &Claim) -> bool {
        match (self, claim) {
            (
                RequestedClaim::Mdoc {
                    namespace,
                    data_element,
                    ..
                },
                Claim::Mdoc {
                    namespace: claim_namespace,
                    data_element: claim_data_element,
                    ..
                },
            ) => namespace == claim_namespace && data_element == claim_data_element,
            (RequestedClaim::Json { path, .. }, Claim::Json { path: claim_path, .. }) => {
                path.len() == claim_path.len()
                    && path
                        .iter()
                        .zip(claim_path)
                        .all(|(requested, actual)| segment_matches(requested, actual))
            }
            _ => false,
        }
    }
}

fn segment_matches(
    requested: &DcqlCredentialClaimsQueryPath,
    actual: &DcqlCredentialClaimsQueryPath,
) -> bool {
    match (requested, actual) {
        (DcqlCredentialClaimsQueryPath::Null, DcqlCredentialClaimsQueryPath::Integer(_)) => true,
        (requested, actual) => requested == actual,
    }
}

/// Returns the claim in `claims` that satisfies `requested`, if any.
///
/// A claim satisfies the request when it has the same namespace and data
/// element (mdoc) or the same path (JSON, `null` matching any array index),
/// and, when the request lists allowed values, its value is one of them.
pub fn find_matching_claim<'a>(claims: &'a [Claim], requested: &RequestedClaim) -> Option<&'a Claim> {
    claims.iter().find(|claim| {
        requested.identifies(claim)
            && requested
                .values()
                .map_or(true, |allowed| allowed.contains(claim.value()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mdoc(namespace: &str, data_element: &str, value: Json) -> Claim {
        Claim::Mdoc {
            namespace: namespace.into(),
            data_element: data_element.into(),
            value,
        }
    }

    fn requested_mdoc(data_element: &str, values: Option<Vec<Json>>) -> RequestedClaim {
        RequestedClaim::Mdoc {
            id: None,
            namespace: "org.iso.18013.5.1".into(),
            data_element: data_element.into(),
            intent_to_retain: false,
            values,
        }
    }

    fn path(segments: Json) -> Vec<DcqlCredentialClaimsQueryPath> {
        serde_json::from_value(segments).unwrap()
    }

    #[test]
    fn mdoc_claims_match_on_namespace_and_name() {
        let claims = vec![
            mdoc("org.iso.18013.5.1", "family_name", json!("Mustermann")),
            mdoc("org.iso.18013.5.1.aamva", "given_name", json!("Max")),
            mdoc("org.iso.18013.5.1", "given_name", json!("Erika")),
        ];

        let found = find_matching_claim(&claims, &requested_mdoc("given_name", None)).unwrap();
        assert_eq!(found.value(), &json!("Erika"));
        assert!(find_matching_claim(&claims, &requested_mdoc("birth_date", None)).is_none());
    }

    #[test]
    fn allowed_values_restrict_the_match() {
        let claims = vec![mdoc("org.iso.18013.5.1", "age_over_18", json!(true))];

        assert!(
            find_matching_claim(&claims, &requested_mdoc("age_over_18", Some(vec![json!(true)])))
                .is_some()
        );
        assert!(find_matching_claim(
            &claims,
            &requested_mdoc("age_over_18", Some(vec![json!(false), json!("true")]))
        )
        .is_none());
    }

    #[test]
    fn json_paths_match_exactly_with_wildcard_indices() {
        let claims = vec![
            Claim::Json {
                path: path(json!(["address"])),
                value: json!({ "locality": "Berlin" }),
            },
            Claim::Json {
                path: path(json!(["address", "locality"])),
                value: json!("Berlin"),
            },
            Claim::Json {
                path: path(json!(["nationalities", 1])),
                value: json!("FR"),
            },
        ];

        let requested = |segments: Json, values: Option<Vec<Json>>| RequestedClaim::Json {
            id: None,
            path: path(segments),
            values,
        };

        assert_eq!(
            find_matching_claim(&claims, &requested(json!(["address", "locality"]), None))
                .unwrap()
                .value(),
            &json!("Berlin")
        );
        assert!(find_matching_claim(&claims, &requested(json!(["locality"]), None)).is_none());
        assert!(find_matching_claim(
            &claims,
            &requested(json!(["nationalities", null]), Some(vec![json!("FR")]))
        )
        .is_some());
        assert!(
            find_matching_claim(&claims, &requested(json!(["nationalities", 0]), None)).is_none()
        );
    }

    #[test]
    fn formats_never_cross_match() {
        let claims = vec![Claim::Json {
            path: path(json!(["org.iso.18013.5.1", "given_name"])),
            value: json!("Erika"),
        }];
        assert!(find_matching_claim(&claims, &requested_mdoc("given_name", None)).is_none());
    }
}

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, warn};

use super::{
    claim::{find_matching_claim, Claim, RequestedClaim},
    query::{CredentialQuery, Query},
    response::{
        DcqlResponse, ResponseCredentialSet, ResponseCredentialSetOption, ResponseMatch,
        ResponseMember,
    },
    store::{CredentialSelectionPolicy, CredentialStore, Document},
    DcqlError,
};

/// Executes DCQL queries against a credential store.
pub struct DcqlResolver<'a, S, P> {
    store: &'a S,
    policy: &'a P,
    key_agreement_curves: Vec<String>,
}

impl<'a, S, P> DcqlResolver<'a, S, P>
where
    S: CredentialStore,
    P: CredentialSelectionPolicy,
{
    pub fn new(store: &'a S, policy: &'a P) -> Self {
        Self {
            store,
            policy,
            key_agreement_curves: Vec::new(),
        }
    }

    /// Curves the verifier supports for key agreement, passed on to the
    /// selection policy.
    pub fn with_key_agreement_curves(mut self, curves: Vec<String>) -> Self {
        self.key_agreement_curves = curves;
        self
    }

    /// Resolves `query` against a snapshot of the store.
    pub async fn execute(&self, query: &Query) -> Result<DcqlResponse, DcqlError> {
        let documents = self.store.documents().await.map_err(DcqlError::Store)?;

        let mut matches = HashMap::with_capacity(query.credential_queries().len());
        for credential_query in query.credential_queries() {
            let found = self.match_credential_query(credential_query, &documents).await?;
            debug!(
                query_id = credential_query.id(),
                count = found.len(),
                "Matched credential query"
            );
            matches.insert(credential_query.id(), found);
        }

        let credential_sets = if query.credential_set_queries().is_empty() {
            query
                .credential_queries()
                .iter()
                .map(|credential_query| {
                    let found = &matches[credential_query.id()];
                    if found.is_empty() {
                        warn!(query_id = credential_query.id(), "No matches for required query");
                        return Err(DcqlError::credential_query(
                            credential_query.id(),
                            "no matches for required credential query",
                        ));
                    }
                    Ok(ResponseCredentialSet::new(
                        false,
                        vec![ResponseCredentialSetOption::new(vec![ResponseMember::new(
                            found.clone(),
                        )])],
                    ))
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            let mut credential_sets = Vec::new();
            for (index, set_query) in query.credential_set_queries().iter().enumerate() {
                let options: Vec<ResponseCredentialSetOption> = set_query
                    .options()
                    .iter()
                    .filter(|option| option.iter().all(|id| !matches[id.as_str()].is_empty()))
                    .map(|option| {
                        ResponseCredentialSetOption::new(
                            option
                                .iter()
                                .map(|id| ResponseMember::new(matches[id.as_str()].clone()))
                                .collect(),
                        )
                    })
                    .collect();

                if !options.is_empty() {
                    credential_sets.push(ResponseCredentialSet::new(
                        !set_query.is_required(),
                        options,
                    ));
                } else if set_query.is_required() {
                    warn!(index, "No option of required credential set is satisfiable");
                    return Err(DcqlError::credential_query(
                        format!("credential_sets[{index}]"),
                        "no option of the required credential set can be satisfied",
                    ));
                } else {
                    debug!(index, "Omitting unsatisfiable optional credential set");
                }
            }
            credential_sets
        };

        Ok(DcqlResponse::new(credential_sets))
    }

    async fn match_credential_query(
        &self,
        credential_query: &CredentialQuery,
        documents: &[Document],
    ) -> Result<Vec<Arc<ResponseMatch>>, DcqlError> {
        let mut candidates: Vec<&Document> = documents
            .iter()
            .filter(|document| document.credentials_for(credential_query).next().is_some())
            .collect();
        candidates.sort_by(|a, b| a.display_name.cmp(&b.display_name));

        let mut found = Vec::new();
        for document in candidates {
            let mut resolutions = Vec::new();
            for credential in document.credentials_for(credential_query) {
                let claims = self
                    .store
                    .decode_claims(credential)
                    .await
                    .map_err(DcqlError::Store)?;
                if let Some(resolved) = resolve_claims(credential_query, &claims) {
                    resolutions.push((credential.clone(), resolved));
                }
            }

            let Some((_, first)) = resolutions.first() else {
                debug!(
                    query_id = credential_query.id(),
                    document_id = %document.id,
                    "Document lacks requested claims"
                );
                continue;
            };

            let requested: Vec<RequestedClaim> =
                first.iter().map(|(requested, _)| requested.clone()).collect();
            // The policy only chooses among credentials holding the claims.
            let answering = Document {
                credentials: resolutions
                    .iter()
                    .map(|(credential, _)| credential.clone())
                    .collect(),
                ..document.clone()
            };
            let Some(selected) = self
                .policy
                .select_credential(
                    &answering,
                    credential_query,
                    &requested,
                    &self.key_agreement_curves,
                )
                .await
            else {
                warn!(
                    query_id = credential_query.id(),
                    document_id = %document.id,
                    "Credential selection declined"
                );
                return Err(DcqlError::credential_query(
                    credential_query.id(),
                    format!("no usable credential in document '{}'", document.display_name),
                ));
            };

            let index = resolutions
                .iter()
                .position(|(credential, _)| credential.id == selected.id)
                .unwrap_or(0);
            let (_, resolved) = resolutions.swap_remove(index);
            found.push(Arc::new(ResponseMatch::new(
                selected,
                resolved,
                credential_query.id().to_owned(),
            )));
        }

        Ok(found)
    }
}

/// Resolves the requested claims of `credential_query` against `claims`.
///
/// Without claim sets every requested claim must be present. With claim
/// sets, the first set whose claims are all present is used and later sets
/// are not considered.
fn resolve_claims(
    credential_query: &CredentialQuery,
    claims: &[Claim],
) -> Option<Vec<(RequestedClaim, Claim)>> {
    let resolve_all = |requested: Vec<&RequestedClaim>| {
        requested
            .into_iter()
            .map(|requested| {
                find_matching_claim(claims, requested)
                    .map(|claim| (requested.clone(), claim.clone()))
            })
            .collect::<Option<Vec<_>>>()
    };

    if credential_query.claim_sets().is_empty() {
        return resolve_all(credential_query.claims().iter().collect());
    }

    credential_query.claim_sets().iter().find_map(|claim_set| {
        let requested = claim_set
            .claim_ids()
            .iter()
            .map(|id| credential_query.claim_by_id(id))
            .collect::<Option<Vec<_>>>()?;
        let resolved = resolve_all(requested);
        if resolved.is_some() {
            debug!(
                query_id = credential_query.id(),
                claim_set = ?claim_set.claim_ids(),
                "Claim set satisfied"
            );
        }
        resolved
    })
}

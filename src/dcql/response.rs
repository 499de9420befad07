use std::sync::Arc;

use super::{
    claim::{Claim, RequestedClaim},
    store::Credential,
};

/// A stored credential that satisfies one credential query, along with the
/// claims it will disclose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMatch {
    credential: Credential,
    claims: Vec<(RequestedClaim, Claim)>,
    credential_query_id: String,
}

impl ResponseMatch {
    pub(crate) fn new(
        credential: Credential,
        claims: Vec<(RequestedClaim, Claim)>,
        credential_query_id: String,
    ) -> Self {
        Self {
            credential,
            claims,
            credential_query_id,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Requested claims paired with the claim that answers each.
    pub fn claims(&self) -> &[(RequestedClaim, Claim)] {
        &self.claims
    }

    pub fn credential_query_id(&self) -> &str {
        &self.credential_query_id
    }
}

/// The alternatives for one credential query slot of an option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMember {
    matches: Vec<Arc<ResponseMatch>>,
}

impl ResponseMember {
    pub(crate) fn new(matches: Vec<Arc<ResponseMatch>>) -> Self {
        Self { matches }
    }

    pub fn matches(&self) -> &[Arc<ResponseMatch>] {
        &self.matches
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCredentialSetOption {
    members: Vec<ResponseMember>,
}

impl ResponseCredentialSetOption {
    pub(crate) fn new(members: Vec<ResponseMember>) -> Self {
        Self { members }
    }

    pub fn members(&self) -> &[ResponseMember] {
        &self.members
    }
}

/// The satisfiable options of one credential set query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCredentialSet {
    optional: bool,
    options: Vec<ResponseCredentialSetOption>,
}

impl ResponseCredentialSet {
    pub(crate) fn new(optional: bool, options: Vec<ResponseCredentialSetOption>) -> Self {
        Self { optional, options }
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn options(&self) -> &[ResponseCredentialSetOption] {
        &self.options
    }
}

/// Every way a query can be satisfied by the store, as of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DcqlResponse {
    credential_sets: Vec<ResponseCredentialSet>,
}

impl DcqlResponse {
    pub(crate) fn new(credential_sets: Vec<ResponseCredentialSet>) -> Self {
        Self { credential_sets }
    }

    pub fn credential_sets(&self) -> &[ResponseCredentialSet] {
        &self.credential_sets
    }

    /// The first match of every member of the first option of every set.
    ///
    /// Used when no one is asked to choose.
    pub fn select_default(&self) -> Vec<Arc<ResponseMatch>> {
        self.credential_sets
            .iter()
            .filter_map(|set| set.options.first())
            .flat_map(|option| option.members.iter())
            .filter_map(|member| member.matches.first().cloned())
            .collect()
    }

    /// Simplifies the tree for presentation to a person.
    ///
    /// A set whose options each have a single member (e.g. "an mDL or a
    /// PID") becomes a single option with a single member, whose matches are
    /// those of the original options in declaration order. Credentials
    /// already listed by an earlier option are not repeated.
    pub fn consolidate(self) -> Self {
        let credential_sets = self
            .credential_sets
            .into_iter()
            .map(|set| {
                if set.options.len() < 2 || set.options.iter().any(|o| o.members.len() != 1) {
                    return set;
                }

                let mut matches: Vec<Arc<ResponseMatch>> = Vec::new();
                for option in set.options {
                    for candidate in option.members.into_iter().flat_map(|m| m.matches) {
                        if !matches.iter().any(|m| m.credential == candidate.credential) {
                            matches.push(candidate);
                        }
                    }
                }

                ResponseCredentialSet::new(
                    set.optional,
                    vec![ResponseCredentialSetOption::new(vec![ResponseMember::new(
                        matches,
                    )])],
                )
            })
            .collect();

        Self { credential_sets }
    }
}

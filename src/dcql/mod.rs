//! Resolution of DCQL queries against the holder's credential store.
//!
//! A [`Query`] is parsed and validated from a DCQL document, executed by a
//! [`DcqlResolver`] against a [`CredentialStore`], and produces a
//! [`DcqlResponse`] describing every way the query can be satisfied. The
//! response is then reduced to one concrete selection, either the
//! deterministic default, a human choice, or a reconciliation with a
//! platform-level preselection ([`DcqlResponse::find_combination`]).

mod claim;
mod query;
mod resolver;
mod response;
mod selection;
mod store;

pub use claim::{find_matching_claim, Claim, RequestedClaim};
pub use query::{ClaimSet, CredentialQuery, CredentialSelector, CredentialSetQuery, Query};
pub use resolver::DcqlResolver;
pub use response::{
    DcqlResponse, ResponseCredentialSet, ResponseCredentialSetOption, ResponseMatch,
    ResponseMember,
};
pub use store::{
    Credential, CredentialFormat, CredentialSelectionPolicy, CredentialStore, Document,
    FirstCredentialSelector, MemoryCredentialStore, StoredCredential, StoredDocument,
};

/// Errors raised while parsing or resolving a DCQL query.
#[derive(Debug, thiserror::Error)]
pub enum DcqlError {
    /// The query document is malformed.
    #[error("malformed DCQL query: {0}")]
    Structural(String),
    /// No combination of stored credentials satisfies a required part of the query.
    #[error("unable to satisfy '{id}': {reason}")]
    CredentialQuery { id: String, reason: String },
    /// The credential store failed to enumerate or decode credentials.
    #[error("credential store error")]
    Store(#[source] anyhow::Error),
}

impl DcqlError {
    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        Self::Structural(reason.into())
    }

    pub(crate) fn credential_query(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CredentialQuery {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

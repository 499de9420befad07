use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::info;

use super::{
    claim::{Claim, RequestedClaim},
    query::{CredentialQuery, CredentialSelector},
};
use crate::core::dcql_query::DcqlCredentialClaimsQueryPath;

/// Format and type of a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "format")]
pub enum CredentialFormat {
    #[serde(rename = "mso_mdoc")]
    Mdoc { doctype: String },
    #[serde(rename = "dc+sd-jwt")]
    SdJwtVc { vct: String },
}

impl CredentialFormat {
    /// Whether a credential of this format can answer a query with `selector`.
    pub fn satisfies(&self, selector: &CredentialSelector) -> bool {
        match (self, selector) {
            (CredentialFormat::Mdoc { doctype }, CredentialSelector::Mdoc { doctype: wanted }) => {
                doctype == wanted
            }
            (CredentialFormat::SdJwtVc { vct }, CredentialSelector::SdJwt { vct_values }) => {
                vct_values.contains(vct)
            }
            _ => false,
        }
    }
}

/// A presentable credential, certified by an issuer and bound to a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub document_id: String,
    pub format: CredentialFormat,
}

/// A document in the holder's wallet and the credentials certified for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub display_name: String,
    pub credentials: Vec<Credential>,
}

impl Document {
    /// Credentials of this document that can answer `query`.
    pub fn credentials_for<'a>(
        &'a self,
        query: &'a CredentialQuery,
    ) -> impl Iterator<Item = &'a Credential> + 'a {
        self.credentials
            .iter()
            .filter(move |credential| credential.format.satisfies(query.selector()))
    }
}

/// Read access to the holder's documents.
///
/// Implementations return a snapshot; the resolver reads it once per execution.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn documents(&self) -> Result<Vec<Document>>;

    /// Decodes the disclosable claims of `credential`.
    async fn decode_claims(&self, credential: &Credential) -> Result<Vec<Claim>>;
}

/// Picks the concrete credential to present from a matching document.
///
/// Returning `None` declines the document, which fails resolution of the query.
#[async_trait]
pub trait CredentialSelectionPolicy: Send + Sync {
    async fn select_credential(
        &self,
        document: &Document,
        query: &CredentialQuery,
        requested_claims: &[RequestedClaim],
        key_agreement_curves: &[String],
    ) -> Option<Credential>;
}

/// Selects the first credential of the document that answers the query.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCredentialSelector;

#[async_trait]
impl CredentialSelectionPolicy for FirstCredentialSelector {
    async fn select_credential(
        &self,
        document: &Document,
        query: &CredentialQuery,
        _requested_claims: &[RequestedClaim],
        _key_agreement_curves: &[String],
    ) -> Option<Credential> {
        document.credentials_for(query).next().cloned()
    }
}

/// A document as loaded into [`MemoryCredentialStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub display_name: String,
    pub credentials: Vec<StoredCredential>,
}

/// A credential with its claims in plain JSON.
///
/// mdoc claims are `{ namespace: { data_element: value } }`; SD-JWT VC
/// claims are the disclosed JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: String,
    #[serde(flatten)]
    pub format: CredentialFormat,
    pub claims: Json,
}

#[derive(Debug, Deserialize)]
struct StoreFile {
    documents: Vec<StoredDocument>,
}

/// An in-memory credential store. Not for production use!
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    documents: Vec<StoredDocument>,
}

impl MemoryCredentialStore {
    pub fn new(documents: Vec<StoredDocument>) -> Self {
        Self { documents }
    }

    /// Loads a store from `{ "documents": [...] }`.
    pub fn from_json(value: Json) -> Result<Self> {
        let file: StoreFile =
            serde_json::from_value(value).context("unable to parse credential store")?;
        info!(count = file.documents.len(), "Loaded documents");
        Ok(Self::new(file.documents))
    }

    pub fn add_document(&mut self, document: StoredDocument) {
        self.documents.push(document);
    }

    fn find(&self, credential: &Credential) -> Option<&StoredCredential> {
        self.documents
            .iter()
            .find(|document| document.id == credential.document_id)?
            .credentials
            .iter()
            .find(|stored| stored.id == credential.id)
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn documents(&self) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .iter()
            .map(|document| Document {
                id: document.id.clone(),
                display_name: document.display_name.clone(),
                credentials: document
                    .credentials
                    .iter()
                    .map(|stored| Credential {
                        id: stored.id.clone(),
                        document_id: document.id.clone(),
                        format: stored.format.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn decode_claims(&self, credential: &Credential) -> Result<Vec<Claim>> {
        let Some(stored) = self.find(credential) else {
            bail!(
                "credential '{}' of document '{}' not found",
                credential.id,
                credential.document_id
            )
        };

        match &stored.format {
            CredentialFormat::Mdoc { .. } => decode_mdoc_claims(&stored.claims),
            CredentialFormat::SdJwtVc { .. } => {
                let mut claims = Vec::new();
                flatten_json_claims(&stored.claims, &mut Vec::new(), &mut claims);
                Ok(claims)
            }
        }
    }
}

fn decode_mdoc_claims(value: &Json) -> Result<Vec<Claim>> {
    let namespaces = value
        .as_object()
        .context("mdoc claims must be an object keyed by namespace")?;

    let mut claims = Vec::new();
    for (namespace, elements) in namespaces {
        let elements = elements
            .as_object()
            .with_context(|| format!("namespace '{namespace}' must be an object"))?;
        for (data_element, value) in elements {
            claims.push(Claim::Mdoc {
                namespace: namespace.clone(),
                data_element: data_element.clone(),
                value: value.clone(),
            });
        }
    }
    Ok(claims)
}

/// Every node below the root becomes a claim addressed by its path.
fn flatten_json_claims(
    value: &Json,
    path: &mut Vec<DcqlCredentialClaimsQueryPath>,
    claims: &mut Vec<Claim>,
) {
    let children: Vec<(DcqlCredentialClaimsQueryPath, &Json)> = match value {
        Json::Object(map) => map
            .iter()
            .map(|(key, child)| (DcqlCredentialClaimsQueryPath::String(key.clone()), child))
            .collect(),
        Json::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, child)| (DcqlCredentialClaimsQueryPath::Integer(index), child))
            .collect(),
        _ => return,
    };

    for (segment, child) in children {
        path.push(segment);
        claims.push(Claim::Json {
            path: path.clone(),
            value: child.clone(),
        });
        flatten_json_claims(child, path, claims);
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> MemoryCredentialStore {
        MemoryCredentialStore::from_json(json!({
            "documents": [{
                "id": "doc-1",
                "display_name": "Erika's PID",
                "credentials": [
                    {
                        "id": "sd-jwt-1",
                        "format": "dc+sd-jwt",
                        "vct": "urn:eudi:pid:1",
                        "claims": {
                            "given_name": "Erika",
                            "address": { "locality": "Berlin" },
                            "nationalities": ["DE", "FR"]
                        }
                    },
                    {
                        "id": "mdoc-1",
                        "format": "mso_mdoc",
                        "doctype": "eu.europa.ec.eudi.pid.1",
                        "claims": { "eu.europa.ec.eudi.pid.1": { "family_name": "Mustermann" } }
                    }
                ]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn lists_documents_with_their_credentials() {
        let documents = store().documents().await.unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].credentials.len(), 2);
        assert_eq!(documents[0].credentials[1].document_id, "doc-1");
        assert_eq!(
            documents[0].credentials[1].format,
            CredentialFormat::Mdoc {
                doctype: "eu.europa.ec.eudi.pid.1".into()
            }
        );
    }

    #[tokio::test]
    async fn decodes_json_claims_at_every_depth() {
        let store = store();
        let documents = store.documents().await.unwrap();
        let claims = store
            .decode_claims(&documents[0].credentials[0])
            .await
            .unwrap();

        let paths: Vec<Json> = claims
            .iter()
            .map(|claim| match claim {
                Claim::Json { path, .. } => serde_json::to_value(path).unwrap(),
                Claim::Mdoc { .. } => panic!("unexpected mdoc claim"),
            })
            .collect();
        assert!(paths.contains(&json!(["address"])));
        assert!(paths.contains(&json!(["address", "locality"])));
        assert!(paths.contains(&json!(["nationalities", 1])));
        assert_eq!(claims.len(), 6);
    }

    #[tokio::test]
    async fn decodes_mdoc_claims_per_namespace() {
        let store = store();
        let documents = store.documents().await.unwrap();
        let claims = store
            .decode_claims(&documents[0].credentials[1])
            .await
            .unwrap();
        assert_eq!(
            claims,
            vec![Claim::Mdoc {
                namespace: "eu.europa.ec.eudi.pid.1".into(),
                data_element: "family_name".into(),
                value: json!("Mustermann"),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_credentials_fail_to_decode() {
        let credential = Credential {
            id: "missing".into(),
            document_id: "doc-1".into(),
            format: CredentialFormat::SdJwtVc { vct: "x".into() },
        };
        assert!(store().decode_claims(&credential).await.is_err());
    }
}

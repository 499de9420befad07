//! Holder-side engines of a credential wallet: resolution of [DCQL] queries
//! against the wallet's credentials, and a client for a Cloud Secure Area
//! holding the keys those credentials are bound to.
//!
//! [DCQL]: <https://openid.net/specs/openid-4-verifiable-presentations-1_0.html#name-digital-credentials-query-l>
//!
//! # Resolving a DCQL Query
//!
//! A query is parsed and validated into a [`Query`], then executed by a
//! [`DcqlResolver`] against a [`CredentialStore`]:
//!
//! ```ignore
//! use holder_core::dcql::{DcqlResolver, FirstCredentialSelector, MemoryCredentialStore, Query};
//!
//! let query = Query::from_json(request["dcql_query"].clone())?;
//! let store = MemoryCredentialStore::from_json(documents)?;
//!
//! let response = DcqlResolver::new(&store, &FirstCredentialSelector)
//!     .with_key_agreement_curves(vec!["P-256".into()])
//!     .execute(&query)
//!     .await?;
//!
//! // Either let the user choose among `response.credential_sets()`, reconcile
//! // a choice made by the platform credential picker, or take the default.
//! let selection = match response.find_combination(&preselected) {
//!     Some(selection) => selection,
//!     None => response.select_default(),
//! };
//! ```
//!
//! The response lists every way the query can be satisfied: one entry per
//! credential set, each with its satisfiable options, each option with one
//! member per credential query, each member with every matching credential.
//!
//! [`Query`]: crate::dcql::Query
//! [`DcqlResolver`]: crate::dcql::DcqlResolver
//! [`CredentialStore`]: crate::dcql::CredentialStore
//!
//! # Using Remote Keys
//!
//! A [`CloudSecureArea`] registers the device with the server, keeps an
//! end-to-end encrypted session with it and creates and uses remote keys:
//!
//! ```ignore
//! use holder_core::csa::{CloudSecureArea, CloudSecureAreaConfig, KeySettings, KeyUnlockData};
//!
//! let mut csa = CloudSecureArea::new(config, http_client, secure_hardware, authorizer);
//! csa.register("123456").await?;
//!
//! csa.create_key("pid", &KeySettings::default().with_passphrase_required(true))
//!     .await?;
//! let signature = csa
//!     .sign("pid", &data, KeyUnlockData::Interactive(&prompt))
//!     .await?;
//!
//! // Persist the registration to resume after a restart.
//! let registration = serde_json::to_vec(csa.registration().unwrap())?;
//! ```
//!
//! The device's secure hardware and the HTTP transport are supplied by the
//! caller through the [`SecureHardware`] and [`AsyncHttpClient`] traits.
//!
//! [`CloudSecureArea`]: crate::csa::CloudSecureArea
//! [`SecureHardware`]: crate::csa::SecureHardware
//! [`AsyncHttpClient`]: crate::core::util::AsyncHttpClient

pub mod core;
pub mod csa;
pub mod dcql;
pub mod utils;

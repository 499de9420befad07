use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use holder_core::dcql::{
    CredentialStore, DcqlResolver, DcqlResponse, FirstCredentialSelector, MemoryCredentialStore,
    Query, ResponseMatch,
};
use serde_json::{json, Value as Json};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "dcql-resolve")]
#[command(about = "Resolve a DCQL query against a credential store file")]
#[command(version)]
struct Cli {
    /// DCQL query (JSON)
    #[arg(short, long, env = "DCQL_QUERY")]
    query: PathBuf,

    /// Credential store (JSON object with a `documents` array)
    #[arg(short, long, env = "DCQL_STORE")]
    store: PathBuf,

    /// Credentials already chosen by a platform picker, as `document_id/credential_id`
    ///
    /// The selection is reconciled against the response instead of taking
    /// the default one.
    #[arg(short, long, value_delimiter = ',')]
    preselect: Vec<String>,

    /// Curves supported by the verifier for key agreement
    #[arg(long, default_value = "P-256", value_delimiter = ',')]
    key_agreement_curves: Vec<String>,

    /// Merge single-member options before printing
    #[arg(long)]
    consolidate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let query = Query::from_json(read_json(&cli.query)?)?;
    let store = MemoryCredentialStore::from_json(read_json(&cli.store)?)?;

    let response = DcqlResolver::new(&store, &FirstCredentialSelector)
        .with_key_agreement_curves(cli.key_agreement_curves.clone())
        .execute(&query)
        .await?;
    let response = if cli.consolidate {
        response.consolidate()
    } else {
        response
    };

    let selection = if cli.preselect.is_empty() {
        Some(response.select_default())
    } else {
        let documents = store.documents().await?;
        let preselected = cli
            .preselect
            .iter()
            .map(|handle| {
                let (document_id, credential_id) = handle
                    .split_once('/')
                    .with_context(|| format!("expected document_id/credential_id, got '{handle}'"))?;
                documents
                    .iter()
                    .filter(|document| document.id == document_id)
                    .flat_map(|document| document.credentials.iter())
                    .find(|credential| credential.id == credential_id)
                    .cloned()
                    .with_context(|| format!("no credential '{handle}' in store"))
            })
            .collect::<Result<Vec<_>>>()?;
        response.find_combination(&preselected)
    };
    info!(reconciled = selection.is_some(), "Resolved query");

    let output = json!({
        "credential_sets": response_json(&response),
        "selection": selection.map(|matches| matches.iter().map(match_json).collect::<Vec<_>>()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

fn read_json(path: &PathBuf) -> Result<Json> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("{} is not JSON", path.display()))
}

fn response_json(response: &DcqlResponse) -> Json {
    response
        .credential_sets()
        .iter()
        .map(|set| {
            json!({
                "optional": set.is_optional(),
                "options": set.options().iter().map(|option| {
                    option.members().iter().map(|member| {
                        member.matches().iter().map(match_json).collect::<Vec<_>>()
                    }).collect::<Vec<_>>()
                }).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn match_json(found: &Arc<ResponseMatch>) -> Json {
    json!({
        "credential_query_id": found.credential_query_id(),
        "document_id": found.credential().document_id,
        "credential_id": found.credential().id,
        "claims": found.claims().iter().map(|(_, claim)| claim).collect::<Vec<_>>(),
    })
}

/// Logs go to stderr so stdout stays valid JSON.
fn setup_logging(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true),
        )
        .init();
}

//! docmesh CLI
//!
//! Thin wrapper around docmesh-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create a document with its initial fields
//! docmesh docs create --set title=notes --set count=3
//!
//! # List stored documents
//! docmesh docs list
//!
//! # Print a document as JSON
//! docmesh docs show <document_id>
//!
//! # Set a root field
//! docmesh docs set <document_id> done=true
//!
//! # Delete a document
//! docmesh docs delete <document_id>
//!
//! # Run two in-process repos and watch them converge
//! docmesh demo --latency-ms 50
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use automerge::Automerge;
use clap::{Parser, Subcommand};
use docmesh_core::{
    put_root_value, DocHandle, DocumentId, MemoryNetworkAdapter, RedbStorageAdapter, Repo,
    RepoConfig, StorageAdapter,
};
use tokio::time::{sleep, timeout};

/// How long a command waits for a document to become ready
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// docmesh - replicated document store
#[derive(Parser)]
#[command(name = "docmesh")]
#[command(version = "0.1.0")]
#[command(about = "docmesh - replicated document store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.docmesh/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Document management
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// Run two in-memory peers and sync a document between them
    Demo {
        /// One-way latency of the in-memory link in milliseconds
        #[arg(long, default_value_t = 20)]
        latency_ms: u64,
    },
}

#[derive(Subcommand)]
enum DocsAction {
    /// Create a new document
    Create {
        /// Initial field as key=value (repeatable, at least one)
        #[arg(long = "set", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// List stored documents
    List,
    /// Print a document as JSON
    Show {
        /// Document ID (base58)
        document_id: String,
    },
    /// Set a root field of a document
    Set {
        /// Document ID (base58)
        document_id: String,
        /// Field as key=value; the value is parsed as JSON when possible
        field: String,
    },
    /// Delete a document
    Delete {
        /// Document ID (base58)
        document_id: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.docmesh/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".docmesh")
        .join("data")
}

/// Parse a `key=value` field, reading the value as JSON and falling back to a string
fn parse_field(s: &str) -> Result<(String, serde_json::Value)> {
    let Some((key, raw)) = s.split_once('=') else {
        anyhow::bail!("Invalid field '{}': expected KEY=VALUE", s);
    };
    if key.is_empty() {
        anyhow::bail!("Invalid field '{}': key is empty", s);
    }
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// A repo over the redb file in `data_dir`
fn open_repo(data_dir: &Path) -> Result<(Repo, Arc<RedbStorageAdapter>)> {
    let config = RepoConfig::load_or_create(data_dir.join("config.json"))?;
    let storage = Arc::new(RedbStorageAdapter::open(data_dir.join("docmesh.redb"))?);
    let repo = Repo::new(config, Some(storage.clone()));
    Ok((repo, storage))
}

/// Look up a stored document, failing if this node has never saved it
async fn find_stored(
    repo: &Repo,
    storage: &RedbStorageAdapter,
    document_id: &str,
) -> Result<DocHandle<Automerge>> {
    let id = DocumentId::from(document_id);
    if storage.load(&id)?.is_none() {
        anyhow::bail!("Document not found: {}", document_id);
    }
    let handle = repo.find(&id);
    timeout(READY_TIMEOUT, handle.value())
        .await
        .map_err(|_| anyhow::anyhow!("Timed out loading document {}", document_id))??;
    Ok(handle)
}

async fn run_demo(latency: Duration) -> Result<()> {
    let alice = Repo::new(RepoConfig::with_peer_id("alice"), None);
    let bob = Repo::new(RepoConfig::with_peer_id("bob"), None);

    let original = alice.create();
    original.change(|tx| {
        put_root_value(tx, "title", &serde_json::json!("demo"))?;
        put_root_value(tx, "count", &serde_json::json!(1))
    })?;
    let id = original.document_id().clone();
    println!("alice created {}", id);

    let (a, b) = MemoryNetworkAdapter::connected_pair(latency);
    alice.add_network_adapter(a.clone());
    bob.add_network_adapter(b.clone());
    a.peer_candidate(bob.peer_id().clone());
    b.peer_candidate(alice.peer_id().clone());

    let copy = bob.find(&id);
    let value = timeout(READY_TIMEOUT, copy.to_json())
        .await
        .map_err(|_| anyhow::anyhow!("bob never received {}", id))??;
    println!("bob received: {}", value);

    copy.change(|tx| put_root_value(tx, "count", &serde_json::json!(2)))?;
    timeout(READY_TIMEOUT, async {
        while original.heads() != copy.heads() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("alice never saw bob's change"))?;
    println!("alice now has: {}", original.to_json().await?);

    a.close();
    b.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    match cli.command {
        Commands::Info => {
            let (repo, _storage) = open_repo(&data_dir)?;
            println!("docmesh v0.1.0");
            println!();
            println!("Peer ID: {}", repo.peer_id());
            println!("Data directory: {}", data_dir.display());
            println!("Documents: {}", repo.stored_document_ids()?.len());
        }

        Commands::Docs { action } => {
            let (mut repo, storage) = open_repo(&data_dir)?;
            match action {
                DocsAction::Create { fields } => {
                    let fields = fields
                        .iter()
                        .map(|f| parse_field(f))
                        .collect::<Result<Vec<_>>>()?;
                    let handle = repo.create();
                    handle.change(|tx| {
                        for (key, value) in &fields {
                            put_root_value(tx, key, value)?;
                        }
                        Ok(())
                    })?;
                    repo.flush()?;
                    println!("Created document");
                    println!("  ID: {}", handle.document_id());
                }

                DocsAction::List => {
                    let ids = repo.stored_document_ids()?;
                    if ids.is_empty() {
                        println!("No documents found.");
                    } else {
                        println!("Documents ({}):", ids.len());
                        println!();
                        for id in ids {
                            println!("  {}", id);
                        }
                    }
                }

                DocsAction::Show { document_id } => {
                    let handle = find_stored(&repo, &storage, &document_id).await?;
                    let value = handle.to_json().await?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }

                DocsAction::Set { document_id, field } => {
                    let (key, value) = parse_field(&field)?;
                    let handle = find_stored(&repo, &storage, &document_id).await?;
                    handle.change(|tx| put_root_value(tx, &key, &value))?;
                    repo.flush()?;
                    println!("Set {} on {}", key, document_id);
                }

                DocsAction::Delete { document_id } => {
                    let id = DocumentId::from(document_id.as_str());
                    if storage.load(&id)?.is_none() {
                        anyhow::bail!("Document not found: {}", document_id);
                    }
                    repo.delete(&id);
                    storage.remove(&id)?;
                    println!("Deleted document: {}", document_id);
                }
            }
            repo.shutdown()?;
        }

        Commands::Demo { latency_ms } => {
            run_demo(Duration::from_millis(latency_ms)).await?;
        }
    }

    Ok(())
}

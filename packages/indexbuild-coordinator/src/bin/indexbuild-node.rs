//! Index build node CLI
//!
//! Runs the coordinator as a secondary against a SQLite catalog and replays a
//! committed log stored as JSON lines (one `OplogEntry` per line).
//!
//! # Usage
//!
//! ```bash
//! # Load documents (JSON lines) into a namespace
//! indexbuild-node load --db node.db --namespace test.coll --file docs.jsonl
//!
//! # Recover and replay the committed log
//! indexbuild-node replay --db node.db --oplog oplog.jsonl --config coordinator.yaml
//!
//! # List published indexes
//! indexbuild-node indexes --db node.db --namespace test.coll
//! ```
//!
//! A fatal halt exits with status 14; restarting `replay` resumes after the
//! last durably applied entry.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indexbuild_coordinator::{
    CoordinatorConfig, InMemoryOplog, IndexBuildCoordinator, OplogEntry, TracingDiagnostics,
};
use indexbuild_storage::{IndexCatalogStore, SqliteCatalogStore};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "indexbuild-node")]
#[command(about = "Index build coordinator node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover, then apply the committed log
    Replay {
        /// SQLite catalog path
        #[arg(long)]
        db: PathBuf,

        /// Committed log (JSON lines)
        #[arg(long)]
        oplog: PathBuf,

        /// Coordinator config (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Insert documents from a JSON lines file
    Load {
        #[arg(long)]
        db: PathBuf,

        #[arg(short, long)]
        namespace: String,

        #[arg(short, long)]
        file: PathBuf,
    },

    /// List published indexes of a namespace
    Indexes {
        #[arg(long)]
        db: PathBuf,

        #[arg(short, long)]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Replay { db, oplog, config } => replay(&db, &oplog, config.as_deref()).await,
        Commands::Load {
            db,
            namespace,
            file,
        } => load(&db, &namespace, &file).await,
        Commands::Indexes { db, namespace } => indexes(&db, &namespace).await,
    }
}

async fn replay(db: &Path, oplog_path: &Path, config: Option<&Path>) -> Result<()> {
    let config = match config {
        Some(path) => CoordinatorConfig::from_yaml_file(path)?,
        None => CoordinatorConfig::default(),
    };
    let storage = Arc::new(SqliteCatalogStore::open(db)?);
    let node = IndexBuildCoordinator::new(config, storage, Arc::new(TracingDiagnostics))?;

    let report = node.recover().await?;
    info!(
        rolled_back = report.rolled_back.len(),
        resume_after = ?report.last_applied,
        "recovered"
    );

    let oplog = read_oplog(oplog_path)?;
    match node.applier().run_from(&oplog).await {
        Ok(report) => {
            info!(
                applied = report.applied,
                builds_committed = report.builds_committed,
                last_applied = ?report.last_applied,
                "replay complete"
            );
            Ok(())
        }
        Err(e) => match node.halt_signal().halt() {
            Some(halt) => {
                error!(reason = %halt.reason, code = halt.code, "Fatal assertion, exiting");
                node.terminate();
                std::process::exit(halt.code);
            }
            None => Err(e.into()),
        },
    }
}

async fn load(db: &Path, namespace: &str, file: &Path) -> Result<()> {
    let storage = SqliteCatalogStore::open(db)?;
    let bodies = read_json_lines::<serde_json::Value>(file)?;
    let ids = storage.insert_documents(namespace, bodies).await?;
    println!("Inserted {} documents into {}", ids.len(), namespace);
    Ok(())
}

async fn indexes(db: &Path, namespace: &str) -> Result<()> {
    let storage = SqliteCatalogStore::open(db)?;
    for index in storage.list_indexes(namespace).await? {
        println!(
            "{}\t{}\t{} entries",
            index.descriptor.name, index.descriptor.key_spec, index.entry_count
        );
    }
    Ok(())
}

fn read_oplog(path: &Path) -> Result<InMemoryOplog> {
    let oplog = InMemoryOplog::new();
    for entry in read_json_lines::<OplogEntry>(path)? {
        oplog.append(entry)?;
    }
    Ok(oplog)
}

fn read_json_lines<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut items = Vec::new();
    for (number, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), number + 1))?;
        items.push(item);
    }
    Ok(items)
}

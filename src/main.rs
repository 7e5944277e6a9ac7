//! # RAG Harness CLI (`rag`)
//!
//! ## Usage
//!
//! ```bash
//! rag --config ./config/rag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag init` | Create the SQLite database and run schema migrations |
//! | `rag index [--root DIR]` | Incrementally index a directory tree |
//! | `rag watch [--root DIR]` | Index, then reindex on every change until Ctrl-C |
//! | `rag ingest <paths…>` | Ingest individual files |
//! | `rag query "<text>"` | Similarity query over one modality |
//! | `rag serve` | Start the HTTP server |
//! | `rag maintain <op>` | `analyze`, `vacuum`, or `search-quality <ef>` |
//! | `rag models` | Model lifecycle status |
//! | `rag dead-letters` | Inspect or clear failed items |
//! | `rag stats` | Store, embedding, and queue counters |
//!
//! Results go to stdout as JSON. Progress and logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rag_harness::config;
use rag_harness::events::{self, IngestEvent, ProgressMode};
use rag_harness::facade::{IngestItem, IngestRequest, MaintenanceOp, QueryRequest, RagService};
use rag_harness_core::models::Modality;
use serde::Serialize;

/// RAG Harness: chunking, embedding, vector search, and incremental indexing
/// over a local SQLite store.
#[derive(Parser)]
#[command(name = "rag", version, about = "RAG Harness: local ingestion and retrieval core")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Index a directory tree, re-embedding only what changed.
    Index {
        /// Root directory. Defaults to `indexing.root`.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Print progress events as NDJSON on stderr.
        #[arg(long)]
        json: bool,
    },

    /// Index a directory tree, then keep it indexed as files change.
    Watch {
        /// Root directory. Defaults to `indexing.root`.
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Ingest files. Paths must lie under `limits.allowed_paths`.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Override the modality inferred from each file's extension.
        #[arg(long)]
        modality: Option<Modality>,

        #[arg(long)]
        json: bool,
    },

    /// Query the store.
    Query {
        q: String,

        #[arg(long, default_value = "docs")]
        modality: Modality,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Start the HTTP server on `server.bind`.
    Serve,

    /// Run store maintenance.
    Maintain {
        #[command(subcommand)]
        op: MaintainOp,
    },

    /// Show model lifecycle status.
    Models,

    /// List items that exhausted their retries.
    DeadLetters {
        #[arg(long, default_value_t = 50)]
        limit: i64,

        /// Delete every dead letter instead of listing.
        #[arg(long)]
        clear: bool,
    },

    /// Show store, embedding, and queue counters.
    Stats,
}

#[derive(Subcommand)]
enum MaintainOp {
    /// Refresh query-planner statistics.
    Analyze,
    /// Reclaim space after deletes.
    Vacuum,
    /// Set the HNSW `ef_search` without rebuilding.
    SearchQuality { ef_search: usize },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn progress_mode(json: bool) -> ProgressMode {
    if json {
        ProgressMode::Json
    } else {
        ProgressMode::default_for_tty()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    rag_harness::logging::init(&cfg.logging)?;

    if let Commands::Init = cli.command {
        let pool = rag_harness::db::connect(&cfg).await?;
        rag_harness::migrate::run_migrations(&pool, &cfg).await?;
        pool.close().await;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let service = RagService::open(cfg).await?;

    let outcome = run(&service, cli.command).await;
    service.shutdown().await;
    outcome
}

async fn run(service: &Arc<RagService>, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Index { root, json } => {
            let run = service.index(root)?;
            let reporter = progress_mode(json).reporter("index");
            events::drain(run.events, reporter.as_ref()).await;
            let session = run.session.await??;
            print_json(&session)?;
        }
        Commands::Watch { root, json } => {
            let runs = service
                .watch(root, progress_mode(json), async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("shutdown requested");
                })
                .await?;
            print_json(&serde_json::json!({ "runs": runs }))?;
        }
        Commands::Ingest { paths, modality, json } => {
            let items = paths.into_iter().map(|p| IngestItem::file(p, modality)).collect();
            let (correlation_id, rx) = service.ingest_stream(IngestRequest { items }).await?;
            let reporter = progress_mode(json).reporter("ingest");
            match events::drain(rx, reporter.as_ref()).await {
                Some(IngestEvent::Complete {
                    processed,
                    successful,
                    failed,
                }) => {
                    print_json(&serde_json::json!({
                        "correlation_id": correlation_id,
                        "processed": processed,
                        "successful": successful,
                        "failed": failed,
                    }))?;
                    if failed > 0 {
                        bail!("{} of {} items failed; see `rag dead-letters`", failed, processed);
                    }
                }
                Some(IngestEvent::Error { error, error_type, .. }) => bail!("[{}] {}", error_type, error),
                other => bail!("ingest ended without a result: {:?}", other),
            }
        }
        Commands::Query { q, modality, top_k } => {
            let response = service.query(&QueryRequest { q, modality, top_k }).await?;
            print_json(&response)?;
        }
        Commands::Serve => {
            rag_harness::server::run_server(Arc::clone(service)).await?;
        }
        Commands::Maintain { op } => {
            let op = match op {
                MaintainOp::Analyze => MaintenanceOp::Analyze,
                MaintainOp::Vacuum => MaintenanceOp::Vacuum,
                MaintainOp::SearchQuality { ef_search } => MaintenanceOp::SearchQuality { ef_search },
            };
            service.maintenance(op).await?;
            print_json(&op)?;
        }
        Commands::Models => print_json(&service.models())?,
        Commands::DeadLetters { limit, clear } => {
            if clear {
                let removed = service.clear_dead_letters().await?;
                print_json(&serde_json::json!({ "cleared": removed }))?;
            } else {
                print_json(&service.dead_letters(limit).await?)?;
            }
        }
        Commands::Stats => print_json(&service.stats().await?)?,
    }
    Ok(())
}

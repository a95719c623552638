//! # RAG Harness CLI (`rag`)
//!
//! The `rag` binary drives the retrieval core from the shell: schema setup,
//! document ingestion, querying, document management, and reporting.
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
//! | `rag ingest <file>` | Chunk, embed, and store a UTF-8 text file |
//! | `rag query "<text>"` | Retrieve the top-k chunks for a query |
//! | `rag get <id>` | Print a stored document and its chunks |
//! | `rag delete <id>` | Delete a document and its chunks |
//! | `rag stats` | Index and cache statistics |
//! | `rag health` | Pool, model, and database health |
//!
//! ## Examples
//!
//! ```bash
//! rag init
//! rag ingest ./notes/neo4j.txt --category databases
//! rag query "what is neo4j" --k 3
//! rag query "graph storage" --mode threshold --threshold 0.4 --json
//! ```
//!
//! Logs go to stderr and are filtered by `RUST_LOG`
//! (default `rag_harness=info`).

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use rag_harness::config::{self, Config};
use rag_harness::engine::RagEngine;
use rag_harness::sqlite_store::SqliteStore;
use rag_harness::stats;
use rag_harness::{db, migrate};
use rag_harness_core::search::QueryResponse;

/// RAG Harness CLI: hybrid retrieval over a local SQLite index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/rag.example.toml` for every option.
#[derive(Parser)]
#[command(name = "rag", version, about)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, default_value = "./config/rag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite file if missing and applies all migrations.
    /// Idempotent.
    Init,

    /// Ingest a UTF-8 text file as one document.
    ///
    /// The file is split into overlapping chunks, every chunk is embedded,
    /// and the document is stored atomically. Ingesting the same file twice
    /// creates two documents.
    Ingest {
        /// File to ingest.
        file: PathBuf,

        /// Source label (defaults to the file path).
        #[arg(long)]
        source: Option<String>,

        /// Category label (defaults to "general").
        #[arg(long)]
        category: Option<String>,

        /// Print the receipt as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Retrieve the most relevant chunks for a query.
    ///
    /// Modes:
    ///   hybrid    vector and keyword scores fused with weight alpha (default)
    ///   vector    cosine similarity only
    ///   threshold cosine similarity, dropping results below --threshold
    Query {
        /// Query text.
        query: String,

        /// Number of results (defaults to retrieval.default_k).
        #[arg(long)]
        k: Option<usize>,

        /// Retrieval mode: hybrid, vector, or threshold.
        #[arg(long)]
        mode: Option<String>,

        /// Minimum cosine score. Implies threshold mode when --mode is unset.
        #[arg(long)]
        threshold: Option<f64>,

        /// Vector weight for hybrid fusion, in [0, 1].
        #[arg(long)]
        alpha: Option<f64>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print a document and its chunks by id.
    Get {
        /// Document UUID.
        id: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete a document and all of its chunks.
    Delete {
        /// Document UUID.
        id: String,
    },

    /// Show document, chunk, and cache statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Check pool, embedding model, and database health.
    ///
    /// Exits non-zero when any dependency is unhealthy.
    Health {
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("rag_harness=info"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing()?;

    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        return run_init(&cfg).await;
    }

    let engine = RagEngine::from_config(&cfg).await?;
    let result = run(&engine, &cfg, cli.command).await;
    engine.close().await;
    result
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(cfg)?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    println!("Database initialized successfully.");
    Ok(())
}

async fn run(
    engine: &RagEngine<SqliteStore>,
    cfg: &Config,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Init => run_init(cfg).await?,
        Commands::Ingest {
            file,
            source,
            category,
            json,
        } => {
            let receipt = engine
                .ingest_file(&file, source, category)
                .await
                .with_context(|| format!("failed to ingest {}", file.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&receipt)?);
            } else {
                println!(
                    "Ingested {} ({} chunks, {} bytes) as {}",
                    receipt.source, receipt.chunks, receipt.bytes, receipt.document_id
                );
            }
        }
        Commands::Query {
            query,
            k,
            mode,
            threshold,
            alpha,
            json,
        } => {
            let req = engine.request(&query, k, mode.as_deref(), threshold, alpha)?;
            let response = engine.query(&req).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&response);
            }
        }
        Commands::Get { id, json } => {
            let Some(doc) = engine.get_document(&id).await? else {
                bail!("document not found: {}", id);
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                let created = chrono::DateTime::from_timestamp(doc.created_at, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| doc.created_at.to_string());
                println!("--- Document ---");
                println!("id: {}", doc.id);
                println!("source: {}", doc.source);
                println!("category: {}", doc.category);
                println!("created_at: {}", created);
                println!("chunks: {}", doc.chunks.len());
                println!("---");
                println!();
                println!("{}", doc.content);
                println!();
                for chunk in &doc.chunks {
                    println!("--- Chunk {} (offset {}) ---", chunk.index, chunk.start);
                    println!("{}", chunk.text);
                }
            }
        }
        Commands::Delete { id } => {
            if !engine.delete_document(&id).await? {
                bail!("document not found: {}", id);
            }
            println!("Deleted {}", id);
        }
        Commands::Stats { json } => {
            let stats = engine.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                let db_size = std::fs::metadata(&cfg.db.path).map(|m| m.len()).ok();
                stats::print_stats(&stats, db_size);
            }
        }
        Commands::Health { json } => {
            let health = engine.health().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                stats::print_health(&health);
            }
            if !health.is_healthy() {
                bail!("unhealthy");
            }
        }
    }
    Ok(())
}

fn print_results(response: &QueryResponse) {
    if response.results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, r) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} #{} (doc: {})",
            i + 1,
            r.score,
            r.source,
            r.chunk_index,
            r.document_id
        );
        println!("    {}", r.text.trim().replace('\n', " "));
        println!();
    }

    let t = &response.timing;
    println!(
        "{} result(s), mode {}, {:.1} ms{}",
        response.results.len(),
        response.mode.name(),
        t.total_ms,
        if t.cached { " (cached)" } else { "" }
    );
}

//! # Excuse Harness CLI (`exh`)
//!
//! ## Usage
//!
//! ```bash
//! exh --config ./config/exh.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `exh init` | Create the SQLite database and run schema migrations |
//! | `exh sources` | List configured reference-material sources |
//! | `exh run "<situation>"` | Run the pipeline: candidates, selection, draft, review |
//! | `exh similar "<text>"` | Find similar past artifacts in vector memory |
//! | `exh cache purge` | Delete expired cache entries |
//! | `exh memory export <file>` | Write vector memory to a JSONL file |
//! | `exh memory import <file>` | Restore vector memory from a JSONL file |
//! | `exh serve` | Start the HTTP API |
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use excuse_harness::config;
use excuse_harness::export;
use excuse_harness::migrate;
use excuse_harness::run_cmd::{self, RunOptions};
use excuse_harness::server;
use excuse_harness::sources;
use excuse_harness::stores::Stores;

/// Excuse Harness CLI: news-backed excuse generation with caching and
/// vector memory.
#[derive(Parser)]
#[command(
    name = "exh",
    about = "Excuse Harness: a pipeline for news-backed excuses with caching and vector memory",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/exh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// List configured sources.
    Sources,

    /// Run the pipeline for one situation.
    Run {
        /// The situation that needs an excuse, e.g. "late to standup".
        situation: String,

        #[arg(long)]
        context: Option<String>,

        /// Who will receive the message, e.g. "manager".
        #[arg(long)]
        recipient: Option<String>,

        /// professional, casual, apologetic, or confident.
        #[arg(long)]
        tone: Option<String>,

        /// national_funny, national_absurd, international_funny, or international_absurd.
        #[arg(long)]
        news: Option<String>,

        /// Skip the evidence stage.
        #[arg(long)]
        no_evidence: bool,

        /// Candidate to select, 1-based. Defaults to the first.
        #[arg(long)]
        pick: Option<usize>,

        /// Approve the first draft without prompting.
        #[arg(long)]
        approve: bool,
    },

    /// Find similar past artifacts.
    Similar {
        text: String,

        #[arg(long)]
        limit: Option<usize>,

        /// excuse, evidence, or message.
        #[arg(long)]
        category: Option<String>,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Vector memory backup and restore.
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Delete every expired entry.
    Purge,
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Write every record, superseded ones included, as JSON Lines.
    Export { file: PathBuf },
    /// Restore records from a JSON Lines export. Existing ids are skipped.
    Import { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            sources::list_sources(&cfg)?;
        }
        Commands::Run {
            situation,
            context,
            recipient,
            tone,
            news,
            no_evidence,
            pick,
            approve,
        } => {
            let opts = RunOptions {
                situation,
                context,
                recipient,
                tone,
                news_category: news,
                no_evidence,
                pick,
                approve,
            };
            run_cmd::run_excuse(&cfg, opts).await?;
        }
        Commands::Similar {
            text,
            limit,
            category,
        } => {
            run_cmd::run_similar(&cfg, &text, limit, category.as_deref()).await?;
        }
        Commands::Cache {
            action: CacheAction::Purge,
        } => {
            let stores = Stores::open(&cfg).await?;
            let removed = stores.cache.purge_expired().await;
            stores.close().await;
            println!("Purged {} expired cache entries.", removed?);
        }
        Commands::Memory { action } => {
            let stores = Stores::open(&cfg).await?;
            let result = match action {
                MemoryAction::Export { file } => export::export_to_file(&*stores.memory, &file)
                    .await
                    .map(|n| format!("Exported {} records to {}", n, file.display())),
                MemoryAction::Import { file } => export::import_from_file(&*stores.memory, &file)
                    .await
                    .map(|s| {
                        format!(
                            "Imported {} records from {} ({} already present)",
                            s.imported,
                            file.display(),
                            s.skipped
                        )
                    }),
            };
            stores.close().await;
            println!("{}", result?);
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

//! # Live Context CLI (`lctx`)
//!
//! ## Usage
//!
//! ```bash
//! lctx --config ./config/lctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lctx serve` | Watch the root, accept webhooks and serve the HTTP API |
//! | `lctx index` | Index the root once and print statistics |
//! | `lctx query "<text>"` | Index the root once and print the assembled context |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use live_context::config;
use live_context::search::{self, QueryOptions};
use live_context::server;

/// Live Context: a live, incrementally updated retrieval index over a codebase.
#[derive(Parser)]
#[command(name = "lctx", version, about)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/lctx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start watchers, ingestion pipelines and the HTTP server.
    ///
    /// Runs until interrupted with Ctrl-C.
    Serve,

    /// Index a directory once and print statistics.
    Index {
        /// Directory to index; overrides `[watch].root`.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Index a directory once and print the context for a query.
    Query {
        /// The query text.
        query: String,

        /// Directory to index; overrides `[watch].root`.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Maximum number of chunks to retrieve.
        #[arg(long)]
        k: Option<usize>,

        /// Drop results scoring below this.
        #[arg(long)]
        min_score: Option<f32>,

        /// Token budget of the assembled context.
        #[arg(long)]
        budget: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve => server::run_server(cfg).await?,
        Commands::Index { root } => search::run_index(cfg, root.as_deref()).await?,
        Commands::Query {
            query,
            root,
            k,
            min_score,
            budget,
        } => {
            let opts = QueryOptions {
                root,
                k,
                min_score,
                budget,
            };
            search::run_query(cfg, &query, opts).await?;
        }
    }

    Ok(())
}

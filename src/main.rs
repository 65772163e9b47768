//! # mycoder CLI
//!
//! ```bash
//! mycoder --config ./config/mycoder.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mycoder init` | Create the SQLite database and run schema migrations |
//! | `mycoder serve` | Start the HTTP server |
//! | `mycoder index <root>` | Index a directory in the foreground |
//! | `mycoder search "<query>"` | Lexical search over indexed projects |
//!
//! Logging goes to stderr and honors `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mycoder::{cli, config, server};

/// mycoder: a project-aware coding assistant server.
///
/// Every command reads `--config` (optional TOML); `MYCODER_*` environment
/// variables take precedence over the file.
#[derive(Parser)]
#[command(
    name = "mycoder",
    about = "mycoder: hybrid retrieval over local projects, grounded chat, and knowledge curation",
    version
)]
struct Cli {
    /// Path to the configuration file (TOML). Missing files mean defaults.
    #[arg(long, global = true, default_value = "./config/mycoder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `server.bind`.
    Serve,

    /// Index a project directory, creating the project on first use.
    Index {
        /// Project root directory.
        root: PathBuf,

        /// Project name; defaults to the directory name.
        #[arg(long)]
        name: Option<String>,

        /// Re-chunk every file, ignoring modification times.
        #[arg(long)]
        full: bool,
    },

    /// Search the lexical index.
    Search {
        query: String,

        /// Restrict to one project id.
        #[arg(long)]
        project: Option<String>,

        #[arg(long, default_value_t = 8)]
        limit: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_tracing();

    let cfg = config::load_config(&args.config)?;

    match args.command {
        Commands::Init => cli::run_init(&cfg).await?,
        Commands::Serve => server::run_server(cfg).await?,
        Commands::Index { root, name, full } => {
            cli::run_index(cfg, &root, name.as_deref(), full).await?
        }
        Commands::Search {
            query,
            project,
            limit,
        } => cli::run_search(cfg, &query, project.as_deref(), limit).await?,
    }

    Ok(())
}

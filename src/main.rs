//! # shelfmatch CLI
//!
//! ## Usage
//!
//! ```bash
//! shelfmatch --config ./config/shelfmatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `shelfmatch run` | Match two catalogs and report price comparisons |
//! | `shelfmatch size "<text>"` | Show how a size descriptor normalizes |
//! | `shelfmatch classify "<name>"` | Show classification, department, and normalized name |
//! | `shelfmatch check` | Validate the configuration |
//!
//! Logs go to stderr and are controlled by `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use shelfmatch::config;
use shelfmatch::match_cmd::{self, MatchOptions};

/// shelfmatch: match products between two grocery catalogs and compare
/// prices per unit.
#[derive(Parser)]
#[command(name = "shelfmatch", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/shelfmatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Match a primary catalog against a competitor catalog.
    Run {
        /// Primary store catalog (JSON).
        #[arg(long)]
        primary: PathBuf,

        /// Competitor store catalog (JSON).
        #[arg(long)]
        competitor: PathBuf,

        /// Write the JSON report here (`-` for stdout).
        #[arg(long)]
        json: Option<PathBuf>,

        /// Write the CSV report here.
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Override `matching.confidence_threshold`.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Normalize a size descriptor.
    Size {
        text: String,
    },

    /// Classify a product name with the configured taxonomy.
    Classify {
        name: String,

        /// Store category label used as a secondary hint.
        #[arg(long)]
        category: Option<String>,
    },

    /// Validate the configuration file.
    Check,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shelfmatch=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // Size parsing needs no configuration.
    if let Commands::Size { text } = &cli.command {
        return match_cmd::run_size(text);
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            primary,
            competitor,
            json,
            csv,
            threshold,
        } => {
            let opts = MatchOptions {
                primary,
                competitor,
                json,
                csv,
                threshold,
            };
            match_cmd::run_match(&cfg, &opts).await?;
        }
        Commands::Classify { name, category } => {
            match_cmd::run_classify(&cfg, &name, category.as_deref())?;
        }
        Commands::Check => {
            match_cmd::run_check(&cfg)?;
        }
        Commands::Size { .. } => {}
    }

    Ok(())
}

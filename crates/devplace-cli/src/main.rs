//! devplace CLI
//!
//! Offline inspection of device usage and placement plans for a node snapshot.

mod commands;

use clap::{Parser, Subcommand};
use devplace_core::PlacementConfig;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// devplace - device accounting and placement for a single node
#[derive(Parser, Debug)]
#[command(name = "devplace")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Placement configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration; RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show per-instance usage of a node snapshot
    Usage {
        /// Snapshot file (TOML or JSON)
        snapshot: PathBuf,
    },

    /// Place the snapshot's device requests and show the offers
    Plan {
        /// Snapshot file (TOML or JSON)
        snapshot: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PlacementConfig::from_file(path)?,
        None => PlacementConfig::default(),
    };

    // Initialize logging
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Usage { snapshot } => {
            let snapshot = commands::Snapshot::load(&snapshot)?;
            commands::usage(&snapshot, &config, cli.json)?;
        }
        Commands::Plan { snapshot } => {
            let snapshot = commands::Snapshot::load(&snapshot)?;
            commands::plan(&snapshot, &config, cli.json)?;
        }
    }

    Ok(())
}

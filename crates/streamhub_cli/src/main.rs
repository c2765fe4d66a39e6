//! StreamHub CLI
//!
//! Command-line tools for running and inspecting a change-stream hub.
//!
//! # Commands
//!
//! - `check-config` - Validate a configuration file and print the effective settings
//! - `demo` - Run a hub against the in-memory store and print its stats

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// StreamHub command-line tools.
#[derive(Parser)]
#[command(name = "streamhub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Path to a JSON configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run a hub on the in-memory store with synthetic mutations
    Demo {
        /// Path to a JSON configuration file (defaults are used if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of mutations to commit
        #[arg(short, long, default_value = "30")]
        events: u64,

        /// Drop the store connection after this many mutations
        #[arg(short, long)]
        drop_after: Option<u64>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig { config } => {
            commands::check_config::run(&config)?;
        }
        Commands::Demo {
            config,
            events,
            drop_after,
        } => {
            commands::demo::run(config.as_deref(), events, drop_after).await?;
        }
        Commands::Version => {
            println!("StreamHub CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

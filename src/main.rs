//! Address Forensics - transaction correlation and risk analysis for ledger addresses

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

// Use the library crate
use address_forensics::cli::commands::{self, AnalyzeOptions};
use address_forensics::config::Config;

/// Address Forensics - correlation, clustering and risk analysis
#[derive(Parser)]
#[command(name = "forensics")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON
    #[arg(long, env = "FORENSICS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze an address
    Analyze {
        /// Focal address
        address: String,

        /// Read raw transfers from a JSON file instead of the indexer
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Cluster expansion depth (1-3)
        #[arg(long)]
        depth: Option<usize>,

        /// Drop clusters with fewer transactions
        #[arg(long)]
        min_transactions: Option<usize>,

        /// Drop clusters with less volume
        #[arg(long)]
        min_volume: Option<f64>,

        /// Maximum transactions to fetch
        #[arg(short, long)]
        limit: Option<u32>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("address_forensics=info".parse()?);
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Analyze {
            address,
            input,
            depth,
            min_transactions,
            min_volume,
            limit,
            json,
        } => {
            let options = AnalyzeOptions {
                input,
                depth,
                min_transactions,
                min_volume,
                limit,
                json,
            };
            commands::analyze(&config, &address, options).await
        }
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

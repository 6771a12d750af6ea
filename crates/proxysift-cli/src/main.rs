//! proxysift - VLESS endpoint validator.
//!
//! Reads a list of endpoint URIs, validates them through an external
//! xray-compatible core, and writes the live ones ordered by latency.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// proxysift - VLESS endpoint validator
#[derive(Parser, Debug)]
#[command(name = "proxysift")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate endpoints from a list and write the live ones
    Check(CheckArgs),
}

/// Arguments for `proxysift check`.
#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// Input file: one endpoint URI per line
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output file: live URIs, ascending latency
    #[arg(short, long)]
    pub output: PathBuf,

    /// TOML configuration file (defaults apply without one)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Explicit path to the core binary; searched in $PATH and the working
    /// directory otherwise
    #[arg(long)]
    pub binary: Option<PathBuf>,

    /// Override the configured batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Override the configured worker count
    #[arg(long)]
    pub workers: Option<usize>,

    /// How many top survivors to list in the summary
    #[arg(long, default_value = "20")]
    pub top: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Check(args) => commands::check::run(args).await,
    }
}

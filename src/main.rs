//! binlog - Segmented append-only binary log
//!
//! Operator CLI for inspecting and writing a binlog directory.

mod commands;
mod config;

use binlog_store::LogManager;
use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "binlog")]
#[command(about = "Append to and inspect a segmented binary log")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "BINLOG_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the segment files
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Segment file base name
    #[arg(short, long)]
    name: Option<String>,

    /// Segment capacity in megabytes
    #[arg(long)]
    capacity_mb: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Append a record and print its address
    Append {
        /// Record payload (or @file to read from file)
        data: String,

        /// Status byte stored with the record
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        status: i8,

        /// Fsync before returning
        #[arg(long)]
        fsync: bool,
    },

    /// Read the record at an address
    Get {
        /// Record address
        address: u64,

        /// Print the payload bytes only
        #[arg(long)]
        raw: bool,
    },

    /// Take records in append order
    Pop {
        /// Start after this address instead of the beginning
        #[arg(long)]
        after: Option<u64>,

        /// Number of records to take
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Print records as JSON lines
    Dump {
        /// Start after this address instead of the beginning
        #[arg(long)]
        after: Option<u64>,

        /// Stop after this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Check every record's integrity markers
    Verify,

    /// Show segments, capacity and statistics
    Info,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(path) = &cli.config {
        tracing::debug!("Loaded config from {}", path.display());
    }
    if let Some(dir) = cli.dir {
        config.storage.data_dir = dir;
    }
    if let Some(name) = cli.name {
        config.storage.base_name = name;
    }
    if let Some(mb) = cli.capacity_mb {
        config.storage.capacity_mb = mb;
    }
    tracing::debug!(
        "Using {}/{} (capacity={} bytes, sync_on_append={})",
        config.storage.data_dir.display(),
        config.storage.base_name,
        config.storage.capacity(),
        config.storage.sync_on_append
    );

    let log = LogManager::open(config.storage.binlog_config())?;

    let (result, closed) = commands::execute_and_close(&log, cli.command);

    let mut failed = false;
    match result {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(commands::CommandError::Unclean(summary)) => {
            println!("{}", summary);
            failed = true;
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            failed = true;
        }
    }

    if let Err(e) = closed {
        tracing::error!("Failed to close binlog: {}", e);
        eprintln!("{}: {}", "Close failed".red(), e);
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

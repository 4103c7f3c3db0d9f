//! walvault CLI
//!
//! Offline tools around the walvault backup agent.
//!
//! # Commands
//!
//! - `inspect-wal` - Decode a raw WAL segment file and list its records
//! - `status` - Show the resume position recorded in the store
//! - `restore-wal` - Restore one WAL segment (for `restore_command`)
//! - `fetch-base` - Download the newest base backup as a tar stream

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use walvault_agent::AgentConfig;
use walvault_wal::Lsn;

/// walvault command-line tools.
#[derive(Parser)]
#[command(name = "walvault")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./walvault.conf, then /etc/walvault.conf)
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw WAL segment file and list its records
    InspectWal {
        /// Segment file to read
        file: PathBuf,

        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the backup position recorded in the store
    Status {
        /// Timeline to resolve against
        #[arg(short, long, default_value = "1")]
        timeline: u32,
    },

    /// Restore one WAL segment from the store
    RestoreWal {
        /// Segment file name requested by the server (%f)
        segment: String,

        /// Destination path (%p)
        dest: PathBuf,
    },

    /// Download the newest base backup
    FetchBase {
        /// Newest timeline to accept
        #[arg(short, long, default_value = "1")]
        timeline: u32,

        /// Only consider backups that started at or before this LSN (HI/LO)
        #[arg(long)]
        max_lsn: Option<Lsn>,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Show version information
    Version,
}

fn load_config(path: Option<PathBuf>) -> Result<AgentConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => AgentConfig::load(&path)?,
        None => AgentConfig::discover()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::InspectWal {
            file,
            limit,
            format,
        } => {
            commands::inspect_wal::run(&file, limit, &format)?;
        }
        Commands::Status { timeline } => {
            let config = load_config(cli.config)?;
            commands::status::run(&config, timeline).await?;
        }
        Commands::RestoreWal { segment, dest } => {
            let config = load_config(cli.config)?;
            commands::restore::restore_wal(&config, &segment, &dest).await?;
        }
        Commands::FetchBase {
            timeline,
            max_lsn,
            out,
        } => {
            let config = load_config(cli.config)?;
            commands::restore::fetch_base(&config, timeline, max_lsn, &out).await?;
        }
        Commands::Version => {
            println!("walvault v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

//! xatm CLI
//!
//! Command-line tools for inspecting transaction journals.
//!
//! # Commands
//!
//! - `dump` - Print every record of a journal
//! - `dangling` - List transactions left in doubt
//! - `verify` - Check record framing and checksums

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// xatm transaction journal tools.
#[derive(Parser)]
#[command(name = "xatm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the journal file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print journal records, oldest generation first
    Dump {
        /// Maximum number of records to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Also print records failing their checksum
        #[arg(short, long)]
        include_invalid: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List transactions left in COMMITTING or ROLLING_BACK
    Dangling {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify record framing and checksums
    Verify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Dump {
            limit,
            include_invalid,
            format,
        } => {
            let path = cli.path.ok_or("Journal path required for dump")?;
            commands::dump::run(&path, limit, include_invalid, &format)?;
        }
        Commands::Dangling { format } => {
            let path = cli.path.ok_or("Journal path required for dangling")?;
            commands::dangling::run(&path, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Journal path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Version => {
            println!("xatm CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

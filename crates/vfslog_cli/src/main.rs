//! vfslog CLI
//!
//! Command-line tools for vfslog record stores.
//!
//! # Commands
//!
//! - `diff` - Structurally compare two stores
//! - `inspect` - Display store and log statistics
//! - `verify` - Check store consistency and log integrity
//! - `dump-oplog` - Dump operation log entries for debugging
//! - `compact` - Fold old log entries into a snapshot
//! - `recover` - Rebuild a store from its log into a new directory

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// vfslog command-line store tools.
#[derive(Parser)]
#[command(name = "vfslog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Structurally compare two stores
    Diff {
        /// Base store directory
        base: PathBuf,

        /// Target store directory
        target: PathBuf,

        /// Stop after this many differences
        #[arg(short, long)]
        max_elements: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display store and log statistics
    Inspect {
        /// List every live record
        #[arg(short, long)]
        records: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check store consistency and log integrity
    Verify {
        /// Check the record store
        #[arg(short, long)]
        store: bool,

        /// Check the operation log
        #[arg(short, long)]
        log: bool,

        /// Check all (default if no flags specified)
        #[arg(short, long)]
        all: bool,
    },

    /// Dump operation log entries for debugging
    DumpOplog {
        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Start at this log position (default: log begin)
        #[arg(short, long)]
        from: Option<u64>,

        /// Output format (text, json)
        #[arg(short = 'o', long, default_value = "text")]
        format: String,
    },

    /// Fold old log entries into a snapshot
    Compact {
        /// Compact up to this position (default: log end)
        #[arg(short, long)]
        up_to: Option<u64>,

        /// Dry run - show the boundary that would be used
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Rebuild a store from its log into a new directory
    Recover {
        /// Directory to rebuild into; must not exist or be empty
        target: PathBuf,

        /// Recover up to this position (default: log end)
        #[arg(short, long)]
        to: Option<u64>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
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
        Commands::Diff {
            base,
            target,
            max_elements,
            format,
        } => {
            commands::diff::run(&base, &target, max_elements, &format)?;
        }
        Commands::Inspect { records, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, records, &format)?;
        }
        Commands::Verify { store, log, all } => {
            let path = cli.path.ok_or("Store path required for verify")?;
            let check_all = all || (!store && !log);
            commands::verify::run(&path, store || check_all, log || check_all)?;
        }
        Commands::DumpOplog {
            limit,
            from,
            format,
        } => {
            let path = cli.path.ok_or("Store path required for dump-oplog")?;
            commands::dump_oplog::run(&path, limit, from, &format)?;
        }
        Commands::Compact { up_to, dry_run } => {
            let path = cli.path.ok_or("Store path required for compact")?;
            commands::compact::run(&path, up_to, dry_run)?;
        }
        Commands::Recover { target, to, format } => {
            let path = cli.path.ok_or("Store path required for recover")?;
            commands::recover::run(&path, &target, to, &format)?;
        }
        Commands::Version => {
            println!("vfslog CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("vfslog core v{}", vfslog_core::VERSION);
            println!("default store version {}", vfslog_core::DEFAULT_STORE_VERSION);
        }
    }

    Ok(())
}

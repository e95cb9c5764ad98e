//! opsync CLI
//!
//! Command-line tools for opsync operation queues.
//!
//! # Commands
//!
//! - `inspect` - Display pending counts and stored versions
//! - `dump-queue` - Dump queued operations for debugging
//! - `enqueue` - Append an operation by hand
//! - `reset-version` - Overwrite a project's stored sync version
//! - `sync` - Run one sync cycle against an HTTP server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// opsync command-line queue tools.
#[derive(Parser)]
#[command(name = "opsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue directory
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
    /// Display pending counts and stored versions per project
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump queued operations for debugging
    DumpQueue {
        /// Only dump this project
        #[arg(long)]
        project: Option<String>,

        /// Maximum number of operations per project
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Append an operation to the queue
    Enqueue {
        /// Owning project
        #[arg(long)]
        project: String,

        /// Operation type, e.g. node.create
        #[arg(long = "type")]
        op_type: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Timeline id
        #[arg(long, default_value = "main")]
        timeline: String,

        /// Layer id
        #[arg(long)]
        layer: Option<String>,

        /// Originating device id
        #[arg(long, default_value = "opsync-cli")]
        device: String,
    },

    /// Overwrite the stored sync version of a project
    ResetVersion {
        /// Project to reset
        #[arg(long)]
        project: String,

        /// New version
        #[arg(long, default_value = "0")]
        to: u64,
    },

    /// Run one sync cycle against an HTTP sync server
    Sync {
        /// Server base URL, e.g. https://sync.example.com
        #[arg(long)]
        server: String,

        /// Project to sync
        #[arg(long)]
        project: String,

        /// This client's device id
        #[arg(long, default_value = "opsync-cli")]
        device: String,

        /// Bearer token
        #[arg(long)]
        token: Option<String>,

        /// JSON file with sync settings (camelCase keys)
        #[arg(long)]
        config: Option<PathBuf>,
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
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Queue path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::DumpQueue {
            project,
            limit,
            format,
        } => {
            let path = cli.path.ok_or("Queue path required for dump-queue")?;
            commands::dump_queue::run(&path, project.as_deref(), limit, &format)?;
        }
        Commands::Enqueue {
            project,
            op_type,
            payload,
            timeline,
            layer,
            device,
        } => {
            let path = cli.path.ok_or("Queue path required for enqueue")?;
            let args = commands::enqueue::EnqueueArgs {
                project,
                op_type,
                payload,
                timeline,
                layer,
                device,
            };
            commands::enqueue::run(&path, args)?;
        }
        Commands::ResetVersion { project, to } => {
            let path = cli.path.ok_or("Queue path required for reset-version")?;
            commands::reset_version::run(&path, &project, to)?;
        }
        Commands::Sync {
            server,
            project,
            device,
            token,
            config,
        } => {
            let path = cli.path.ok_or("Queue path required for sync")?;
            let args = commands::sync::SyncArgs {
                server,
                project,
                device,
                token,
                config,
            };
            commands::sync::run(&path, args)?;
        }
        Commands::Version => {
            println!("opsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

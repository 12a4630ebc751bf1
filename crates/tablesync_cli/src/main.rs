//! tablesync CLI
//!
//! Offline tools for looking at what a sync pass would do.
//!
//! # Commands
//!
//! - `classify` - Classify a changeset page against a local row snapshot
//! - `attachments` - Plan the file transfers for one row
//! - `etag-cache` - Dump a persisted ETag cache
//! - `token` - Issue a bearer token for the reference server

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// tablesync command-line tools.
#[derive(Parser)]
#[command(name = "tablesync")]
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
    /// Classify a changeset page against local rows
    Classify {
        /// JSON array of local rows
        #[arg(short, long)]
        local: PathBuf,

        /// JSON changeset page
        #[arg(short, long)]
        page: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Plan attachment transfers for one row
    Attachments {
        /// Attachment store root directory
        #[arg(short, long)]
        root: PathBuf,

        /// Table id
        #[arg(short, long)]
        table: String,

        /// Row id
        #[arg(long)]
        row: String,

        /// JSON row manifest from the server
        #[arg(short, long)]
        manifest: PathBuf,

        /// File names the row references (comma separated)
        #[arg(long, value_delimiter = ',')]
        refs: Vec<String>,

        /// Upload byte cap per request
        #[arg(long, default_value_t = 10 * 1024 * 1024)]
        cap: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump a persisted ETag cache
    EtagCache {
        /// Cache file
        #[arg(short, long)]
        path: PathBuf,

        /// Only show entries of this table
        #[arg(short, long)]
        table: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Issue a bearer token for the reference server
    Token {
        /// Shared HMAC secret
        #[arg(short, long)]
        secret: String,

        /// User the token is issued to
        #[arg(short, long)]
        user: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Classify {
            local,
            page,
            format,
        } => {
            commands::classify::run(&local, &page, &format)?;
        }
        Commands::Attachments {
            root,
            table,
            row,
            manifest,
            refs,
            cap,
            format,
        } => {
            let request = commands::attachments::PlanRequest {
                table: table.into(),
                row: row.into(),
                refs,
                cap,
            };
            commands::attachments::run(&root, &manifest, &request, &format)?;
        }
        Commands::EtagCache {
            path,
            table,
            format,
        } => {
            commands::etag_cache::run(&path, table.as_deref(), &format)?;
        }
        Commands::Token { secret, user } => {
            println!("{}", commands::token::issue(secret.as_bytes(), &user)?);
        }
        Commands::Version => {
            println!("tablesync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

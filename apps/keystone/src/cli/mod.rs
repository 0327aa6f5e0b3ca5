//! # Keystone CLI Module
//!
//! ## Available Commands
//!
//! - `fetch` - Request a document from the remote API and show it normalized
//! - `push` - Normalize a payload file into a fresh store
//! - `schema` - Validate and print the configured schema
//! - `config` - Print the effective configuration

mod commands;

use crate::config::KeystoneConfig;
use clap::{Parser, Subcommand};
use keystone_core::KeystoneError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Keystone - normalized client-side data layer
///
/// Fetches JSON:API style documents and shows them as the identity cache and
/// relationship graph see them.
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to keystone.toml (defaults to ./keystone.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a document and normalize it
    Fetch {
        /// Path or absolute URL
        path: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// JSON file to send as the request body
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Number of pages to follow through `links.next`
        #[arg(long, default_value = "1")]
        pages: usize,

        /// Bypass the request cache
        #[arg(long)]
        reload: bool,
    },

    /// Normalize a payload file without network access
    Push {
        /// Path to the JSON payload
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Validate and print the configured schema
    Schema,

    /// Print the effective configuration
    Config,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), KeystoneError> {
    let config = KeystoneConfig::load(cli.config.as_deref())?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Fetch {
            path,
            method,
            params,
            data,
            pages,
            reload,
        }) => {
            let request = build_request(&path, &method, params, data.as_deref(), reload)?;
            cmd_fetch(&config, json_mode, request, pages).await
        }
        Some(Commands::Push { file }) => cmd_push(&config, json_mode, &file),
        Some(Commands::Schema) | None => cmd_schema(&config, json_mode),
        Some(Commands::Config) => cmd_config(&config, json_mode),
    }
}

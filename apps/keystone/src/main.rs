//! # Keystone
//!
//! Command line front end for the Keystone normalized data layer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 apps/keystone (THE BINARY)               │
//! │                                                          │
//! │   ┌─────────────┐          ┌──────────────────────┐      │
//! │   │    CLI      │          │   keystone.toml      │      │
//! │   │   (clap)    │          │  (config + schema)   │      │
//! │   └──────┬──────┘          └──────────┬───────────┘      │
//! │          └────────────┬───────────────┘                  │
//! │                       ▼                                  │
//! │             ┌──────────────────┐                         │
//! │             │ keystone-request │  fetch, retry, limits   │
//! │             └────────┬─────────┘                         │
//! │                      ▼                                   │
//! │             ┌──────────────────┐                         │
//! │             │  keystone-core   │  identity, graph, cache │
//! │             └──────────────────┘                         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! keystone schema
//! keystone fetch /posts -p include=author
//! keystone push -f payload.json
//! ```

use clap::Parser;
use keystone::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // KEYSTONE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("KEYSTONE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "keystone=info,keystone_request=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    eprintln!(
        r#"
  keystone v{}
  normalized identity cache + relationship graph
"#,
        env!("CARGO_PKG_VERSION")
    );
}

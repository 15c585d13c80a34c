//! Approuter - Main entry point
//!
//! Loads the destination table, binds the listener, and runs the router

use anyhow::{Context, Result};
use approuter::{ConfigError, DestinationTable, ProxyConfig, ProxyServer};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Approuter - a minimal HTTP application router
#[derive(Parser, Debug)]
#[command(name = "approuter")]
#[command(version = "0.1.0")]
#[command(about = "Routes incoming HTTP requests to configured backend destinations")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Inline JSON array of destinations
    #[arg(long, env = "destinations")]
    destinations: Option<String>,

    /// Path to a JSON file holding the destination array (takes
    /// precedence over --destinations)
    #[arg(long, env = "DESTINATIONS_FILE")]
    destinations_file: Option<PathBuf>,

    /// Seconds to wait for a backend to connect and produce response
    /// headers before answering 504
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    upstream_timeout_secs: u64,

    /// Validate the destination configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    // Startup failures exit non-zero
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let table = load_table(&args)?;

    info!("Starting approuter v0.1.0");
    for dest in table.iter() {
        info!(
            "Destination {}: {} -> {}{}",
            dest.name,
            dest.url_prefix,
            dest.target_base_url,
            if dest.forward_auth_token {
                " (forwards auth token)"
            } else {
                ""
            }
        );
    }

    if args.check {
        info!("Destination table OK ({} destinations)", table.len());
        return Ok(());
    }

    let config = ProxyConfig {
        upstream_timeout: Duration::from_secs(args.upstream_timeout_secs),
    };

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;

    let server = Arc::new(ProxyServer::new(config, Arc::new(table)));
    server.run(listener).await
}

/// Load the destination table from the configured file or inline JSON
fn load_table(args: &Args) -> Result<DestinationTable> {
    let table = if let Some(path) = &args.destinations_file {
        DestinationTable::from_file(path)?
    } else if let Some(json) = &args.destinations {
        DestinationTable::from_json(json)?
    } else {
        return Err(ConfigError::Missing.into());
    };

    Ok(table)
}

//! Game Server Console - daemon
//!
//! Supervises one game server subprocess, bridges its console to WebSocket
//! clients, and serves a root-confined file explorer.

#![forbid(unsafe_code)]

mod console;
mod files;
mod http;
mod process;
mod transcript;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gsc_common::Config;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use process::ProcessBridge;

#[derive(Parser)]
#[command(name = "gscd")]
#[command(author, version, about = "Game server console daemon")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gscd.toml")]
    config: PathBuf,

    /// Override the configured listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Starting game server console daemon...");

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.http.bind = bind;
    }
    info!(
        command = %config.server.command.join(" "),
        root = %config.explorer.root.display(),
        "configuration loaded"
    );

    let bridge = Arc::new(ProcessBridge::new(
        config.server.command.clone(),
        config.server.working_dir.clone(),
        config.child_encoding(),
        config.console.transcript_limit,
    ));

    if config.server.autostart {
        match bridge.start().await {
            Ok(()) => info!("server process autostarted"),
            Err(err) => warn!(error = %err, "autostart failed; use /control/start to retry"),
        }
    }

    let bind = config.http.bind;
    let router = http::create_router(http::AppState {
        bridge,
        config: Arc::new(config),
    });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!("Listening on http://{bind}");
    axum::serve(listener, router)
        .await
        .context("http server terminated")?;
    Ok(())
}

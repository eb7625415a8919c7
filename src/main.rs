//! Chat relay server
//!
//! Room-scoped WebSocket message relay: clients join named channels,
//! exchange broadcast chat and slash commands, and have their WebRTC
//! signaling payloads forwarded between room peers.

mod command;
mod config;
mod registry;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::Settings;
use server::WebSocketServer;

/// Chat relay server
///
/// WebSocket relay for room chat and WebRTC signaling
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the settings file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the settings file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("chat-relay v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(bind) = args.bind {
        settings.bind = bind;
    }

    let server = Arc::new(WebSocketServer::new(settings));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

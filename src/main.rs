//! Switchboard
//!
//! WebSocket session hub. Tracks every connection through its lifecycle,
//! routes messages between sessions (direct, group, broadcast), applies
//! backpressure to slow readers and evicts peers that stop responding.

mod app;
mod config;
mod hub;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{AppMode, HubConfig};
use server::WebSocketServer;

/// Switchboard
///
/// WebSocket session hub with relay and lobby applications
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on [default: 8765]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// Shared token required to open a session
    #[arg(long)]
    token: Option<String>,

    /// Application protocol
    #[arg(long, value_enum)]
    mode: Option<AppMode>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded config
    fn apply(self, mut config: HubConfig) -> HubConfig {
        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(bind) = self.bind {
            config = config.with_bind(bind);
        }
        if self.token.is_some() {
            config = config.with_token(self.token);
        }
        if let Some(mode) = self.mode {
            config = config.with_mode(mode);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Switchboard v{}", env!("CARGO_PKG_VERSION"));

    let config = match HubConfig::load_or_default(args.config.as_deref()) {
        Ok(config) => args.apply(config),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };
    config.validate()?;

    if config.token.is_some() {
        info!("Token authentication enabled");
    }

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_flags_uses_defaults() {
        let args = Args::parse_from(["switchboard"]);
        let config = args.apply(HubConfig::default());
        assert_eq!(config, HubConfig::default());
        assert_eq!(config.socket_addr(), "0.0.0.0:8765");
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "switchboard",
            "--port",
            "9100",
            "--bind",
            "127.0.0.1",
            "--token",
            "secret",
            "--mode",
            "lobby",
        ]);
        let config = args.apply(HubConfig::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:9100");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.mode, AppMode::Lobby);
    }
}

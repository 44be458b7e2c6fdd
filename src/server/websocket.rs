//! WebSocket server implementation
//!
//! Accepts TCP connections, hands each one to a connection handler task and
//! runs the liveness monitor. On shutdown every session is moved to Closing
//! and the server waits, bounded by the close grace, for them to drain.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auth::{authenticator_for, Authenticator};
use super::handler::{ConnectionHandler, HandlerSettings};
use crate::app::{build_application, Application};
use crate::config::HubConfig;
use crate::hub::{Hub, LivenessMonitor};

/// WebSocket server for hub sessions
pub struct WebSocketServer {
    config: HubConfig,
    hub: Arc<Hub>,
    app: Arc<dyn Application>,
    auth: Arc<dyn Authenticator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a server running the application selected by `config.mode`
    pub fn new(mut config: HubConfig) -> Self {
        if config.server_id.is_none() {
            config.server_id = Some(Uuid::new_v4().to_string());
        }
        let app = build_application(&config);
        Self::with_application(config, app)
    }

    /// Create a server running a custom application
    pub fn with_application(config: HubConfig, app: Arc<dyn Application>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let auth: Arc<dyn Authenticator> = Arc::from(authenticator_for(config.token.as_deref()));
        Self {
            hub: Arc::new(Hub::new(config.hub_settings())),
            config,
            app,
            auth,
            shutdown_tx,
        }
    }

    /// Replace the upgrade authenticator
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn run_with_listener(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "WebSocket server listening on ws://{} ({:?} mode)",
            listener.local_addr()?,
            self.config.mode
        );

        let monitor = LivenessMonitor::new(Arc::clone(&self.hub), self.config.sweep_interval())
            .spawn(self.shutdown_tx.subscribe());

        let handler = ConnectionHandler::new(
            Arc::clone(&self.hub),
            Arc::clone(&self.app),
            Arc::clone(&self.auth),
            HandlerSettings {
                handshake_timeout: self.config.handshake_timeout(),
                heartbeat_interval: self.config.heartbeat_interval(),
                close_grace: self.config.close_grace(),
            },
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("Accepted TCP connection from {}", peer_addr);
                            let handler = handler.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            connections.spawn(async move {
                                handler.handle(stream, peer_addr, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        drop(listener);
        self.hub.shutdown_all();

        // Handlers finalize their own sessions; the extra grace covers the
        // handshake timeout of sockets that never opened.
        let session_count = self.hub.session_count();
        if session_count > 0 {
            info!("Waiting for {} active sessions to close...", session_count);
        }
        let drain = self.config.close_grace() + self.config.handshake_timeout();
        let drained = timeout(drain, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                connections.len(),
                drain
            );
            connections.shutdown().await;
        }

        if let Err(e) = monitor.await {
            error!("Liveness monitor failed: {}", e);
        }
        info!("Server stopped");
        Ok(())
    }
}

//! WebSocket connection handler
//!
//! Drives one socket through its session lifecycle. The task that owns the
//! handler reads frames and dispatches them through the application; a
//! spawned writer task owns the sink, drains the outbound queue and sends
//! heartbeat pings. The reader stops as soon as the session leaves Open.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error, info, warn};

use super::auth::Authenticator;
use crate::app::Application;
use crate::hub::{CloseReason, Connection, Control, Hub, Message, Payload, SessionState};

/// Timing for one connection
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub close_grace: Duration,
}

/// Handles WebSocket connections for one server
#[derive(Clone)]
pub struct ConnectionHandler {
    hub: Arc<Hub>,
    app: Arc<dyn Application>,
    auth: Arc<dyn Authenticator>,
    settings: HandlerSettings,
}

impl ConnectionHandler {
    pub fn new(
        hub: Arc<Hub>,
        app: Arc<dyn Application>,
        auth: Arc<dyn Authenticator>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            hub,
            app,
            auth,
            settings,
        }
    }

    /// Run a freshly accepted socket until its session is Closed
    pub async fn handle(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let connection = match self.hub.admit(peer_addr) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Cannot admit {}: {}", peer_addr, e);
                return;
            }
        };
        let id = connection.id();

        let auth = Arc::clone(&self.auth);
        let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match auth.authenticate(request) {
                Ok(()) => Ok(response),
                Err(e) => {
                    warn!("Rejected upgrade from {}: {}", peer_addr, e);
                    Err(e.to_response())
                }
            }
        };

        let ws_stream = match timeout(
            self.settings.handshake_timeout,
            accept_hdr_async(stream, callback),
        )
        .await
        {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                debug!("Handshake with {} failed: {}", peer_addr, e);
                self.hub.finalize(id, CloseReason::HandshakeFailed(e.to_string()));
                return;
            }
            Err(_) => {
                debug!("Handshake with {} timed out", peer_addr);
                self.hub
                    .finalize(id, CloseReason::HandshakeFailed("timed out".to_string()));
                return;
            }
        };

        // Shutdown may have finalized the session while it was handshaking
        if let Err(e) = self.hub.open(id) {
            debug!("Session {} did not open: {}", id, e);
            self.hub
                .finalize(id, CloseReason::HandshakeFailed(e.to_string()));
            return;
        }
        self.app.on_open(&self.hub, id);

        let (sink, stream) = ws_stream.split();
        let mut writer = tokio::spawn(write_loop(
            Arc::clone(&self.hub),
            Arc::clone(&connection),
            sink,
            self.settings.heartbeat_interval,
        ));

        self.read_loop(&connection, stream, &mut shutdown_rx).await;

        if timeout(self.settings.close_grace, &mut writer).await.is_err() {
            warn!("Session {} did not drain within the close grace", id);
            writer.abort();
        }

        let reason = connection
            .close_reason()
            .cloned()
            .unwrap_or(CloseReason::PeerClosed);
        self.hub.finalize(id, reason.clone());
        self.app.on_close(&self.hub, id, &reason);
        info!("Connection from {} closed ({})", peer_addr, reason);
    }

    async fn read_loop<S>(
        &self,
        connection: &Connection,
        mut stream: S,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) where
        S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let id = connection.id();
        let mut state_rx = connection.watch_state();
        if *state_rx.borrow_and_update() != SessionState::Open {
            return;
        }

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("WebSocket error from session {}: {}", id, e);
                            self.hub.finalize(id, CloseReason::Transport(e.to_string()));
                            break;
                        }
                        None => {
                            debug!("Session {} stream ended", id);
                            self.hub.finalize(
                                id,
                                CloseReason::Transport("connection reset".to_string()),
                            );
                            break;
                        }
                    };
                    connection.touch(std::time::Instant::now());

                    match frame {
                        WsMessage::Text(text) => {
                            debug!("Received {} bytes of text from {}", text.len(), id);
                            self.app
                                .on_message(&self.hub, Message::text(text).from_session(id));
                        }
                        WsMessage::Binary(data) => {
                            debug!("Received {} bytes of binary from {}", data.len(), id);
                            self.app
                                .on_message(&self.hub, Message::binary(data).from_session(id));
                        }
                        // Pings are answered by tungstenite; both count as activity
                        WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                        WsMessage::Close(frame) => {
                            debug!("Session {} sent close: {:?}", id, frame);
                            self.hub.begin_close(id, CloseReason::PeerClosed);
                            break;
                        }
                        WsMessage::Frame(_) => {}
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() || *state_rx.borrow() != SessionState::Open {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    self.hub.begin_close(id, CloseReason::Shutdown);
                    break;
                }
            }
        }
    }
}

/// Drain the outbound queue onto the socket until the session closes
async fn write_loop<S>(hub: Arc<Hub>, connection: Arc<Connection>, mut sink: S, heartbeat: Duration)
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let id = connection.id();
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = connection.next_outbound() => {
                let Some(message) = next else {
                    break;
                };
                if connection.close_reason().is_some_and(CloseReason::is_abrupt) {
                    break;
                }
                let Some(frame) = to_frame(&message) else {
                    continue;
                };
                if let Err(e) = sink.send(frame).await {
                    debug!("Write to session {} failed: {}", id, e);
                    hub.finalize(id, CloseReason::Transport(e.to_string()));
                    return;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new())).await {
                    debug!("Heartbeat to session {} failed: {}", id, e);
                    hub.finalize(id, CloseReason::Transport(e.to_string()));
                    return;
                }
            }
        }
    }

    // Queue closed and drained
    match connection.close_reason() {
        Some(reason) if reason.is_abrupt() => {}
        reason => {
            let reason = reason.cloned().unwrap_or(CloseReason::Application);
            if let Err(e) = sink.send(WsMessage::Close(Some(close_frame(&reason)))).await {
                debug!("Close frame to session {} not sent: {}", id, e);
            }
        }
    }
    let _ = sink.close().await;
}

/// Wire frame for a queued message
///
/// Close is never queued: the hub turns it into a state transition.
fn to_frame(message: &Message) -> Option<WsMessage> {
    match message.payload() {
        Payload::Text(text) => Some(WsMessage::Text(text.to_string())),
        Payload::Binary(data) => Some(WsMessage::Binary(data.to_vec())),
        Payload::Control(Control::Ping(data)) => Some(WsMessage::Ping(data.to_vec())),
        Payload::Control(Control::Pong(data)) => Some(WsMessage::Pong(data.to_vec())),
        Payload::Control(Control::Close(_)) => None,
    }
}

/// WebSocket close code for a close reason
pub fn close_code(reason: &CloseReason) -> CloseCode {
    match reason {
        CloseReason::PeerClosed | CloseReason::Application => CloseCode::Normal,
        CloseReason::Shutdown => CloseCode::Away,
        CloseReason::LivenessTimeout => CloseCode::Policy,
        CloseReason::QueueOverflow => CloseCode::Again,
        CloseReason::HandshakeFailed(_) | CloseReason::Transport(_) => CloseCode::Error,
    }
}

fn close_frame(reason: &CloseReason) -> CloseFrame<'static> {
    CloseFrame {
        code: close_code(reason),
        reason: Cow::Owned(reason.to_string()),
    }
}

//! Application layer
//!
//! An application receives session lifecycle callbacks and inbound data
//! from the connection handler, and talks back through the hub. Callbacks
//! run on the session's reader task and must not block.

mod chess;
mod lobby;
mod relay;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::config::{AppMode, HubConfig};
use crate::hub::{CloseReason, Hub, HubResult, Message, Payload, SessionId};

pub use chess::*;
pub use lobby::*;
pub use relay::*;

/// Message schema plugged into the server
pub trait Application: Send + Sync + 'static {
    /// Session finished its handshake and is Open
    fn on_open(&self, hub: &Hub, id: SessionId);

    /// Inbound data frame; `message.sender()` is always set
    fn on_message(&self, hub: &Hub, message: Message);

    /// Session is Closed and already removed from the hub. Called exactly
    /// once per session that reached `on_open`.
    fn on_close(&self, hub: &Hub, id: SessionId, reason: &CloseReason);
}

/// Build the application selected by the configuration
pub fn build_application(config: &HubConfig) -> Arc<dyn Application> {
    match config.mode {
        AppMode::Relay => Arc::new(RelayApp::new(config.server_id.clone())),
        AppMode::Lobby => Arc::new(LobbyApp::new()),
    }
}

/// Serialize a message into a text payload
pub(crate) fn encode<T: Serialize>(message: &T) -> Option<Payload> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Payload::Text(json.into())),
        Err(e) => {
            error!("Failed to serialize outbound message: {}", e);
            None
        }
    }
}

/// Send a server-originated JSON message to one session
///
/// Delivery failures are logged and swallowed; the target is either gone
/// or already being closed by the hub.
pub(crate) fn send_json<T: Serialize>(hub: &Hub, to: SessionId, message: &T) -> bool {
    let Some(payload) = encode(message) else {
        return false;
    };
    match hub.unicast(None, to, payload) {
        Ok(_) => true,
        Err(e) => {
            debug!("Dropped reply to {}: {}", to, e);
            false
        }
    }
}

/// Publish a server-originated JSON message to a group
pub(crate) fn publish_json<T: Serialize>(hub: &Hub, group: &str, message: &T) -> HubResult<()> {
    if let Some(payload) = encode(message) {
        hub.publish(None, group, payload)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use serde::de::DeserializeOwned;

    use crate::hub::{Connection, Hub};

    pub fn open_session(hub: &Hub) -> Arc<Connection> {
        let connection = hub.admit("127.0.0.1:7000".parse().unwrap()).unwrap();
        hub.open(connection.id()).unwrap()
    }

    /// Drain a session's queue and decode every text frame
    pub fn received<T: DeserializeOwned>(connection: &Connection) -> Vec<T> {
        connection
            .drain_outbound()
            .iter()
            .filter_map(|m| m.as_text().map(|text| serde_json::from_str(text).unwrap()))
            .collect()
    }
}

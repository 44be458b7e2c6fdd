//! Relay application
//!
//! Generic JSON relay: clients address each other by session id, publish to
//! groups they may subscribe to, or broadcast. Binary frames are forwarded
//! untouched to every other open session.

use tracing::{debug, warn};

use super::{encode, send_json, Application};
use crate::hub::{CloseReason, Hub, HubError, Message, Payload, SessionId};
use crate::server::{ClientEnvelope, ClientMessage, ServerMessage};

pub struct RelayApp {
    server_id: Option<String>,
}

impl RelayApp {
    pub fn new(server_id: Option<String>) -> Self {
        Self { server_id }
    }

    fn handle_text(&self, hub: &Hub, sender: SessionId, text: &str) {
        let envelope = match ClientEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejected frame from {}: {}", sender, e);
                send_json(hub, sender, &ServerMessage::from(e));
                return;
            }
        };

        match envelope.message {
            ClientMessage::Ping { seq } => {
                send_json(hub, sender, &ServerMessage::pong(seq));
            }

            ClientMessage::Send { to, data } => {
                let result = relay(&ServerMessage::direct(sender, data), |payload| {
                    hub.unicast(Some(sender), to, payload)
                });
                if let Err(e) = result {
                    send_json(hub, sender, &ServerMessage::from(e));
                }
            }

            ClientMessage::Publish { group, data } => {
                let message = ServerMessage::group(sender, group.as_str(), data);
                if let Err(e) = relay(&message, |payload| {
                    hub.publish(Some(sender), &group, payload)
                }) {
                    send_json(hub, sender, &ServerMessage::from(e));
                }
            }

            ClientMessage::Broadcast { data, include_self } => {
                let message = ServerMessage::broadcast(sender, data);
                if let Err(e) = relay(&message, |payload| {
                    hub.broadcast(Some(sender), payload, include_self)
                }) {
                    send_json(hub, sender, &ServerMessage::from(e));
                }
            }

            ClientMessage::Subscribe { group } => match hub.join(sender, &group) {
                Ok(_) => {
                    send_json(hub, sender, &ServerMessage::Subscribed { group });
                }
                Err(e) => {
                    send_json(hub, sender, &ServerMessage::from(e));
                }
            },

            ClientMessage::Unsubscribe { group } => {
                hub.leave(sender, &group);
                send_json(hub, sender, &ServerMessage::Unsubscribed { group });
            }
        }
    }
}

/// Encode once, then hand the shared payload to the hub
fn relay<F, T>(message: &ServerMessage, dispatch: F) -> Result<(), HubError>
where
    F: FnOnce(Payload) -> Result<T, HubError>,
{
    match encode(message) {
        Some(payload) => dispatch(payload).map(|_| ()),
        None => Ok(()),
    }
}

impl Application for RelayApp {
    fn on_open(&self, hub: &Hub, id: SessionId) {
        let welcome = match &self.server_id {
            Some(server_id) => ServerMessage::welcome_with_id(id, server_id.as_str()),
            None => ServerMessage::welcome(id),
        };
        send_json(hub, id, &welcome);
    }

    fn on_message(&self, hub: &Hub, message: Message) {
        let Some(sender) = message.sender() else {
            warn!("Relay received a message without a sender");
            return;
        };
        match message.payload() {
            Payload::Text(text) => self.handle_text(hub, sender, text),
            Payload::Binary(data) => {
                if let Err(e) = hub.broadcast(Some(sender), Payload::Binary(data.clone()), false) {
                    warn!("Failed to relay binary frame from {}: {}", sender, e);
                }
            }
            Payload::Control(control) => {
                debug!("Ignoring control frame from {}: {:?}", sender, control);
            }
        }
    }

    fn on_close(&self, _hub: &Hub, id: SessionId, reason: &CloseReason) {
        debug!("Relay session {} left: {}", id, reason);
    }
}

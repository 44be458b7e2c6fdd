//! Routable messages
//!
//! Messages are immutable once built. Payload bodies are reference counted
//! so a fan-out to many sessions shares one allocation.

use std::sync::Arc;

use super::session::{CloseReason, SessionId};

/// Message body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
    Control(Control),
}

/// Control payloads
///
/// Ping and Pong are connection-local and never routed. A scoped Close asks
/// the hub to close the addressed sessions.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Ping(Arc<[u8]>),
    Pong(Arc<[u8]>),
    Close(CloseReason),
}

/// Payload discriminant, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Control,
}

/// Delivery target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Exactly one session
    Session(SessionId),
    /// Every Open member of a group, as of dispatch time
    Group(String),
    /// Every Open session
    Broadcast { include_sender: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
    sender: Option<SessionId>,
    scope: Option<Scope>,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            sender: None,
            scope: None,
        }
    }

    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Self::new(Payload::Text(text.into()))
    }

    pub fn binary(data: impl Into<Arc<[u8]>>) -> Self {
        Self::new(Payload::Binary(data.into()))
    }

    pub fn control(control: Control) -> Self {
        Self::new(Payload::Control(control))
    }

    /// Set the originating session
    pub fn from_session(mut self, sender: SessionId) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the delivery target
    pub fn to(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn sender(&self) -> Option<SessionId> {
        self.sender
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Text(_) => MessageKind::Text,
            Payload::Binary(_) => MessageKind::Binary,
            Payload::Control(_) => MessageKind::Control,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text.as_ref()),
            _ => None,
        }
    }

    /// Payload size in bytes (control frames count their data only)
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Text(text) => text.len(),
            Payload::Binary(data) => data.len(),
            Payload::Control(Control::Ping(data)) | Payload::Control(Control::Pong(data)) => {
                data.len()
            }
            Payload::Control(Control::Close(_)) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

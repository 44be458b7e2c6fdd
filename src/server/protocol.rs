//! Relay protocol message definitions
//!
//! JSON messages exchanged between relay clients and the server. Every
//! message carries a `type` tag; client messages may carry a `version`.
//! Application payloads (`data`) are opaque JSON and forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hub::{HubError, SessionId};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted text frame (1MB)
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Maximum group name length
pub const MAX_GROUP_NAME_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Envelope wrapping client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub message: ClientMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        if json.len() > MAX_FRAME_LENGTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "frame exceeds maximum length of {} bytes",
                MAX_FRAME_LENGTH
            )));
        }
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION || self.version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keepalive
    Ping {
        /// Sequence number echoed in the pong
        seq: u64,
    },

    /// Deliver `data` to one session
    Send { to: SessionId, data: Value },

    /// Deliver `data` to every member of a group
    Publish { group: String, data: Value },

    /// Deliver `data` to every open session
    Broadcast {
        data: Value,
        /// Also deliver to the sender
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        include_self: bool,
    },

    /// Join a group
    Subscribe { group: String },

    /// Leave a group
    Unsubscribe { group: String },
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. }
            | ClientMessage::Send { .. }
            | ClientMessage::Broadcast { .. } => Ok(()),

            ClientMessage::Publish { group, .. }
            | ClientMessage::Subscribe { group }
            | ClientMessage::Unsubscribe { group } => validate_group(group),
        }
    }

    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    pub fn send(to: SessionId, data: Value) -> Self {
        ClientMessage::Send { to, data }
    }

    pub fn publish(group: impl Into<String>, data: Value) -> Self {
        ClientMessage::Publish {
            group: group.into(),
            data,
        }
    }

    pub fn broadcast(data: Value) -> Self {
        ClientMessage::Broadcast {
            data,
            include_self: false,
        }
    }

    pub fn subscribe(group: impl Into<String>) -> Self {
        ClientMessage::Subscribe {
            group: group.into(),
        }
    }

    pub fn unsubscribe(group: impl Into<String>) -> Self {
        ClientMessage::Unsubscribe {
            group: group.into(),
        }
    }
}

fn validate_group(group: &str) -> ProtocolResult<()> {
    if group.is_empty() {
        return Err(ProtocolError::ValidationError(
            "group name cannot be empty".to_string(),
        ));
    }
    if group.len() > MAX_GROUP_NAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "group name exceeds maximum length of {} characters",
            MAX_GROUP_NAME_LENGTH
        )));
    }
    Ok(())
}

// ============================================================================
// Server Messages
// ============================================================================

/// How a relayed message reached its recipient
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryScope {
    Direct,
    Group,
    Broadcast,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once the session is open
    Welcome {
        /// Server protocol version
        version: u32,
        /// Identifier peers use to address this session
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong { seq: u64 },

    /// Data relayed from another session
    Message {
        from: SessionId,
        scope: DeliveryScope,
        #[serde(skip_serializing_if = "Option::is_none")]
        group: Option<String>,
        data: Value,
    },

    /// Subscription confirmed
    Subscribed { group: String },

    /// Unsubscription confirmed
    Unsubscribed { group: String },

    /// Error response
    Error {
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Unsupported protocol version
    UnsupportedVersion,
    /// Addressed session does not exist
    TargetNotFound,
    /// Addressed session is closing
    TargetNotOpen,
    /// Addressed session could not keep up and was disconnected
    TargetOverloaded,
    /// Message not valid in the current state
    InvalidState,
    /// Internal server error
    InternalError,
}

impl ServerMessage {
    pub fn welcome(session_id: SessionId) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            session_id,
            server_id: None,
        }
    }

    pub fn welcome_with_id(session_id: SessionId, server_id: impl Into<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            session_id,
            server_id: Some(server_id.into()),
        }
    }

    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    pub fn direct(from: SessionId, data: Value) -> Self {
        ServerMessage::Message {
            from,
            scope: DeliveryScope::Direct,
            group: None,
            data,
        }
    }

    pub fn group(from: SessionId, group: impl Into<String>, data: Value) -> Self {
        ServerMessage::Message {
            from,
            scope: DeliveryScope::Group,
            group: Some(group.into()),
            data,
        }
    }

    pub fn broadcast(from: SessionId, data: Value) -> Self {
        ServerMessage::Message {
            from,
            scope: DeliveryScope::Broadcast,
            group: None,
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server message from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

impl From<HubError> for ServerMessage {
    fn from(err: HubError) -> Self {
        let code = match &err {
            HubError::TargetNotFound(_) | HubError::NotFound(_) => ErrorCode::TargetNotFound,
            HubError::SessionNotOpen { .. } => ErrorCode::TargetNotOpen,
            HubError::QueueOverflow(_) => ErrorCode::TargetOverloaded,
            HubError::DuplicateIdentifier(_)
            | HubError::LivenessTimeout(_)
            | HubError::Transport(_)
            | HubError::InvalidTransition { .. }
            | HubError::Unroutable => ErrorCode::InternalError,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ping_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_send_addresses_session_by_number() {
        let to = SessionId::new(3, 1);
        let json = format!(r#"{{"type":"send","to":{},"data":"hello"}}"#, to.as_u64());
        let envelope = ClientEnvelope::from_json(&json).unwrap();
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.message, ClientMessage::send(to, json!("hello")));
    }

    #[test]
    fn test_broadcast_include_self_defaults_false() {
        let envelope =
            ClientEnvelope::from_json(r#"{"type":"broadcast","data":{"n":1}}"#).unwrap();
        assert_eq!(envelope.message, ClientMessage::broadcast(json!({"n": 1})));

        let envelope = ClientEnvelope::from_json(
            r#"{"type":"broadcast","data":null,"include_self":true}"#,
        )
        .unwrap();
        assert!(matches!(
            envelope.message,
            ClientMessage::Broadcast {
                include_self: true,
                ..
            }
        ));
    }

    #[test]
    fn test_data_is_opaque_json() {
        let data = json!({"nested": [1, 2, {"deep": true}], "s": "x"});
        let msg = ClientMessage::publish("room", data.clone());
        let parsed = ClientEnvelope::from_json(&ClientEnvelope::new(msg).to_json().unwrap())
            .unwrap();
        match parsed.message {
            ClientMessage::Publish { group, data: got } => {
                assert_eq!(group, "room");
                assert_eq!(got, data);
            }
            other => panic!("Expected Publish, got {:?}", other),
        }
    }

    #[test]
    fn test_subscribe_validation() {
        assert!(ClientMessage::subscribe("news").validate().is_ok());

        let err = ClientMessage::subscribe("").validate().unwrap_err();
        assert!(matches!(err, ProtocolError::ValidationError(_)));

        let long = "g".repeat(MAX_GROUP_NAME_LENGTH + 1);
        assert!(ClientMessage::unsubscribe(long).validate().is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = ClientEnvelope::from_json(r#"{"type":"teleport"}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let result = ClientEnvelope::from_json(r#"{"version":99,"type":"ping","seq":1}"#);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(99))));

        let result = ClientEnvelope::from_json(r#"{"version":0,"type":"ping","seq":1}"#);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(0))));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let huge = format!(
            r#"{{"type":"broadcast","data":"{}"}}"#,
            "x".repeat(MAX_FRAME_LENGTH)
        );
        assert!(matches!(
            ClientEnvelope::from_json(&huge),
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_welcome_serialization() {
        let id = SessionId::new(0, 2);
        let json = ServerMessage::welcome_with_id(id, "srv-1").to_json().unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains(&format!("\"session_id\":{}", id.as_u64())));
        assert!(json.contains("\"server_id\":\"srv-1\""));

        let json = ServerMessage::welcome(id).to_json().unwrap();
        assert!(!json.contains("server_id"));
    }

    #[test]
    fn test_relayed_message_shapes() {
        let from = SessionId::new(1, 0);
        let json = ServerMessage::direct(from, json!("hi")).to_json().unwrap();
        assert!(json.contains("\"scope\":\"direct\""));
        assert!(!json.contains("\"group\""));

        let parsed =
            ServerMessage::from_json(&ServerMessage::group(from, "g", json!(1)).to_json().unwrap())
                .unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Message {
                from,
                scope: DeliveryScope::Group,
                group: Some("g".to_string()),
                data: json!(1),
            }
        );
    }

    #[test]
    fn test_protocol_error_conversion() {
        let msg: ServerMessage = ProtocolError::UnsupportedVersion(7).into();
        match msg {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, Some(ErrorCode::UnsupportedVersion));
                assert!(message.contains('7'));
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_hub_error_conversion() {
        let target = SessionId::new(9, 0);
        let msg: ServerMessage = HubError::TargetNotFound(target).into();
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"code\":\"target_not_found\""));

        let msg: ServerMessage = HubError::QueueOverflow(target).into();
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: Some(ErrorCode::TargetOverloaded),
                ..
            }
        ));
    }
}

//! Hub error taxonomy

use thiserror::Error;

use super::session::{SessionId, SessionState};

/// Errors raised by the registry, session state machine and router
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Duplicate session identifier: {0}")]
    DuplicateIdentifier(SessionId),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {id} is not open (state: {state})")]
    SessionNotOpen { id: SessionId, state: SessionState },

    #[error("Target session not found: {0}")]
    TargetNotFound(SessionId),

    #[error("Outbound queue overflow on session {0}")]
    QueueOverflow(SessionId),

    #[error("Session {0} missed its heartbeat window")]
    LivenessTimeout(SessionId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Message has no delivery scope")]
    Unroutable,
}

impl HubError {
    /// Contract violations indicate a bug rather than an operational event
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            HubError::DuplicateIdentifier(_)
                | HubError::SessionNotOpen { .. }
                | HubError::InvalidTransition { .. }
        )
    }
}

/// Result type for hub operations
pub type HubResult<T> = Result<T, HubError>;

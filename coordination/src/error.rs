//! Error types for turn coordination.

use std::time::Duration;

use thiserror::Error;

use crate::session::SessionId;

/// Errors surfaced by the coordinator and session handles.
///
/// Generation and evaluation failures are not represented here: they are
/// recovered inside the session (see [`crate::gateway::GatewayError`] and
/// [`crate::reaction::EvaluationError`]) and reported on the event bus.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session already active: {0}")]
    SessionAlreadyActive(SessionId),

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Speech duration {duration:?} for {agent_id} exceeds the {max:?} cap")]
    SpeechTooLong {
        agent_id: String,
        duration: Duration,
        max: Duration,
    },

    #[error("Invariant violation in session {session_id}: {message}")]
    InvariantViolation {
        session_id: SessionId,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

impl CoordinationError {
    /// Build an invariant violation for a session.
    pub fn invariant(session_id: &str, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            session_id: session_id.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error means the session is gone (stopped, ended or never existed).
    pub fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_display() {
        let err = CoordinationError::invariant("s-1", "slot already held by sage");
        assert_eq!(
            err.to_string(),
            "Invariant violation in session s-1: slot already held by sage"
        );
        assert!(!err.is_session_gone());
    }

    #[test]
    fn test_session_gone() {
        let err = CoordinationError::SessionNotFound("s-9".into());
        assert!(err.is_session_gone());
        assert_eq!(err.to_string(), "Session not found: s-9");
    }
}

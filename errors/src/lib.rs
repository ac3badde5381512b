//! # Voice Relay Errors
//!
//! Structured error definitions shared by every crate of the relay.
//!
//! The taxonomy mirrors how failures are handled:
//! - [`TransportError`]: transient, absorbed by the reconnect controller
//! - [`ConnectionError`]: surfaced to whoever opened or drives a provider connection
//! - [`SelectionError`]: no provider satisfies a session's requirements
//! - [`StorageError`]: a call-state tier failed
//! - [`SessionError`]: what the orchestrator reports for a call
//! - [`AdminError`]: operator requests against breakers and calls

use thiserror::Error;

/// Failures of a single provider transport (socket, handshake, wire protocol).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("Session handshake rejected: {reason}")]
    Handshake { reason: String },

    #[error("Session handshake not acknowledged within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Send failed: {reason}")]
    Send { reason: String },

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Peer did not answer the previous ping")]
    Unresponsive,

    #[error("Transport closed by peer")]
    Closed
}

impl TransportError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Errors surfaced by a provider connection to its owner.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Circuit breaker for {provider} is open: retry after {retry_after_ms}ms")]
    BreakerOpen {
        provider: String,
        retry_after_ms: u64
    },

    #[error("Transport for {provider} failed: {source}")]
    Transport {
        provider: String,
        #[source]
        source: TransportError
    },

    #[error("Connection to {provider} was disconnected")]
    Disconnected { provider: String },

    #[error("Connection to {provider} is in state {state}")]
    NotReady { provider: String, state: String }
}

/// No provider could be chosen for a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("No capable provider available for {requirements}")]
    NoCapableProvider { requirements: String },

    #[error("Unknown provider: {id}")]
    UnknownProvider { id: String },

    #[error("Provider {id} is registered twice")]
    DuplicateProvider { id: String }
}

/// Call-state storage errors, tagged with the tier that produced them.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Connection to {backend} failed: {reason}")]
    ConnectionError { backend: String, reason: String },

    #[error("Query on {backend} failed: {reason}")]
    QueryError { backend: String, reason: String },

    #[error("Serialization error: {error_type} - {reason}")]
    SerializationError { error_type: String, reason: String },

    #[error("Not found on {backend}:{id}")]
    NotFound { backend: String, id: String },

    #[error("Call {call_id} already has an active record")]
    AlreadyExists { call_id: String },

    #[error("Call {call_id} cannot move from {from} to {to}")]
    InvalidTransition {
        call_id: String,
        from: String,
        to: String
    },

    #[error("Call {call_id} is already in terminal status {status}")]
    TerminalStatus { call_id: String, status: String }
}

impl StorageError {
    pub fn query(backend: &str, reason: impl ToString) -> Self {
        Self::QueryError {
            backend: backend.to_string(),
            reason: reason.to_string()
        }
    }

    pub fn serialization(reason: impl ToString) -> Self {
        Self::SerializationError {
            error_type: "JSON".to_string(),
            reason: reason.to_string()
        }
    }
}

/// Errors reported by the session orchestrator for one call.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Call {call_id} already has an active session")]
    AlreadyActive { call_id: String },

    #[error("No active session for call {call_id}")]
    NotFound { call_id: String }
}

/// Failures of the administrative control surface.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("Unknown circuit breaker: {name}")]
    UnknownBreaker { name: String },

    #[error(transparent)]
    Storage(#[from] StorageError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_open_message_carries_retry_hint() {
        let err = ConnectionError::BreakerOpen {
            provider: "openai".into(),
            retry_after_ms: 1500
        };
        assert_eq!(
            err.to_string(),
            "Circuit breaker for openai is open: retry after 1500ms"
        );
    }

    #[test]
    fn test_session_error_wraps_selection() {
        let err: SessionError = SelectionError::NoCapableProvider {
            requirements: "realtime".into()
        }
        .into();
        assert!(matches!(err, SessionError::Selection(_)));
        assert!(err.to_string().contains("realtime"));
    }

    #[test]
    fn test_admin_error_names_breaker() {
        let err = AdminError::UnknownBreaker {
            name: "missing".into()
        };
        assert_eq!(err.to_string(), "Unknown circuit breaker: missing");
    }

    #[test]
    fn test_terminal_status_message() {
        let err = StorageError::TerminalStatus {
            call_id: "CA1".into(),
            status: "completed".into()
        };
        assert_eq!(err.to_string(), "Call CA1 is already in terminal status completed");
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(
            TransportError::RateLimited {
                retry_after_secs: Some(5)
            }
            .is_rate_limit()
        );
        assert!(!TransportError::Closed.is_rate_limit());
    }
}

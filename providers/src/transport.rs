//! Transport contracts between a provider connection and one provider's
//! wire protocol.

use async_trait::async_trait;
use errors::TransportError;
use relay_core::{AudioFrame, SessionConfig};
use serde_json::Value;
use std::time::Duration;

/// An event decoded from the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Audio(AudioFrame),
    Transcript {
        text: String,
        is_final: bool
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: Value
    },
    /// The provider throttled this session; the transport is unusable
    RateLimited {
        retry_after_secs: Option<u64>
    },
    /// The far end assigned a new session identifier
    SessionUpdated {
        session_id: String
    },
    /// A non-fatal provider error; the session continues
    ProviderError {
        message: String
    },
    Heartbeat
}

/// Why the live transport was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    Transport(TransportError),
    /// The provider closed the stream
    Closed,
    /// No inbound traffic for too long and the liveness probe failed
    Stale,
    RateLimited {
        retry_after: Option<Duration>
    },
    /// Operator-requested reconnect
    Manual
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Closed => f.write_str("closed by provider"),
            Self::Stale => f.write_str("stale connection"),
            Self::RateLimited { retry_after: Some(wait) } => {
                write!(f, "rate limited (retry after {}s)", wait.as_secs())
            }
            Self::RateLimited { retry_after: None } => f.write_str("rate limited"),
            Self::Manual => f.write_str("manual reconnect")
        }
    }
}

/// One live duplex session with a provider.
#[async_trait]
pub trait ProviderTransport: Send {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), TransportError>;

    async fn send_function_result(
        &mut self,
        call_id: &str,
        output: &Value
    ) -> Result<(), TransportError>;

    /// Next inbound event. `None` once the provider closed the stream.
    ///
    /// Must be cancel-safe: it is raced against other work and dropped
    /// whenever that work wins.
    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>>;

    /// Liveness probe used when the connection has gone quiet.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError>;
}

pub struct Connected {
    pub transport: Box<dyn ProviderTransport>,
    /// Session identifier assigned by the provider, if it reports one
    pub session_id: Option<String>
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Opens transports to one provider.
///
/// `connect` returns only after the session setup handshake for `session`
/// has been acknowledged.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, session: &SessionConfig) -> Result<Connected, TransportError>;
}

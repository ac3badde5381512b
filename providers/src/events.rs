use relay_core::AudioFrame;
use serde_json::Value;
use std::time::Duration;

/// What a provider connection reports to its owner, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        session_id: Option<String>
    },
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
    ProviderError {
        message: String
    },
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        backoff: Duration,
        buffered_frames: usize
    },
    Reconnected {
        attempt: u32,
        /// May differ from the identifier before the reconnect
        session_id: Option<String>,
        replayed_frames: usize
    },
    /// Automatic recovery gave up; the connection is in `error`
    Failed {
        reason: String,
        attempts: u32
    },
    Disconnected
}

impl ConnectionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Audio(_) => "audio",
            Self::Transcript { .. } => "transcript",
            Self::FunctionCall { .. } => "function_call",
            Self::ProviderError { .. } => "provider_error",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Reconnected { .. } => "reconnected",
            Self::Failed { .. } => "failed",
            Self::Disconnected => "disconnected"
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    OnHold,
    Transferring,
    Completed,
    Failed
}

impl CallStatus {
    pub const TERMINAL: [CallStatus; 2] = [CallStatus::Completed, CallStatus::Failed];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn non_terminal() -> [CallStatus; 5] {
        [
            Self::Initiated,
            Self::Ringing,
            Self::Answered,
            Self::OnHold,
            Self::Transferring
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Call {call_id} is already {from}; cannot move to {to}")]
pub struct InvalidTransition {
    pub call_id: String,
    pub from: CallStatus,
    pub to: CallStatus
}

/// The persisted record of one telephony call.
///
/// `ended_at` is set exactly when `status` is terminal. Once terminal the
/// record is frozen; it stays in the durable store as an audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    /// Identifier assigned by the telephony provider
    pub call_id: String,
    /// Internal identifier of the relay session bound to this call
    pub session_id: Uuid,
    pub telephony_provider: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub from_number: String,
    pub to_number: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>
}

impl CallState {
    pub fn new(
        call_id: impl Into<String>,
        telephony_provider: impl Into<String>,
        direction: CallDirection,
        from_number: impl Into<String>,
        to_number: impl Into<String>
    ) -> Self {
        let now = Utc::now();
        Self {
            call_id: call_id.into(),
            session_id: Uuid::new_v4(),
            telephony_provider: telephony_provider.into(),
            direction,
            status: CallStatus::Initiated,
            from_number: from_number.into(),
            to_number: to_number.into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            ended_at: None
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Move to `status`, keeping `ended_at` in step with terminality.
    pub fn apply_status(
        &mut self,
        status: CallStatus,
        at: DateTime<Utc>
    ) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                call_id: self.call_id.clone(),
                from: self.status,
                to: status
            });
        }

        self.status = status;
        self.updated_at = at;
        self.ended_at = status.is_terminal().then_some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CallState {
        CallState::new(
            "CA123",
            "twilio",
            CallDirection::Inbound,
            "+15550001",
            "+15550002"
        )
    }

    #[test]
    fn test_new_call_is_initiated_without_end() {
        let call = sample();
        assert_eq!(call.status, CallStatus::Initiated);
        assert!(call.ended_at.is_none());
        assert!(call.is_active());
    }

    #[test]
    fn test_terminal_status_sets_ended_at() {
        let mut call = sample();
        let now = Utc::now();
        call.apply_status(CallStatus::Answered, now).unwrap();
        assert!(call.ended_at.is_none());

        call.apply_status(CallStatus::Completed, now).unwrap();
        assert_eq!(call.ended_at, Some(now));
        assert!(!call.is_active());
    }

    #[test]
    fn test_terminal_call_is_frozen() {
        let mut call = sample();
        call.apply_status(CallStatus::Failed, Utc::now()).unwrap();

        let err = call
            .apply_status(CallStatus::Answered, Utc::now())
            .unwrap_err();
        assert_eq!(err.from, CallStatus::Failed);
        assert_eq!(err.to, CallStatus::Answered);
        assert_eq!(call.status, CallStatus::Failed);
    }

    #[test]
    fn test_status_spelling_round_trips_through_strings() {
        for status in CallStatus::non_terminal()
            .into_iter()
            .chain(CallStatus::TERMINAL)
        {
            let text = status.to_string();
            assert_eq!(text.parse::<CallStatus>().unwrap(), status);
        }
        assert_eq!(CallStatus::OnHold.as_ref(), "on_hold");
    }
}

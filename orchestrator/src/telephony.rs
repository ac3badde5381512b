//! The telephony side of a session.
//!
//! A call's media stream is represented by a pair of bounded queues. The
//! relay holds the [`TelephonyLeg`]; whatever speaks the telephony
//! provider's media protocol holds the matching [`TelephonyEndpoint`].
//! Dropping the endpoint's audio sender counts as a hangup.

use relay_core::{AudioFrame, CallStatus, ProviderId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// Requests from the telephony side that end or redirect the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegControl {
    Hangup,
    Transfer { target: String }
}

/// What a session reports toward the telephony side, besides audio.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        provider: ProviderId,
        session_id: Option<String>
    },
    Transcript {
        text: String,
        is_final: bool
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: Value
    },
    ProviderReconnecting {
        provider: ProviderId,
        attempt: u32
    },
    ProviderReconnected {
        provider: ProviderId,
        session_id: Option<String>
    },
    /// Conversation context held by the previous provider is lost
    ProviderSwitched {
        from: ProviderId,
        to: ProviderId
    },
    Ended {
        status: CallStatus,
        reason: String
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Telephony leg is closed")]
pub struct LegClosed;

/// Relay-side half of a call's media stream.
pub struct TelephonyLeg {
    pub(crate) inbound: mpsc::Receiver<AudioFrame>,
    pub(crate) outbound: mpsc::Sender<AudioFrame>,
    pub(crate) control: mpsc::Receiver<LegControl>,
    pub(crate) events: mpsc::Sender<SessionEvent>
}

impl std::fmt::Debug for TelephonyLeg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelephonyLeg").finish_non_exhaustive()
    }
}

impl TelephonyLeg {
    /// Forward provider audio toward the caller. A full queue drops the frame
    /// rather than stall the provider side.
    pub(crate) fn deliver_audio(&self, frame: AudioFrame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                trace!(sequence = frame.sequence(), "Outbound audio queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false
        }
    }

    pub(crate) fn notify(&self, event: SessionEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            trace!(?event, "Session event queue full, event dropped");
        }
    }
}

/// Telephony-side half of a call's media stream.
pub struct TelephonyEndpoint {
    audio_in: Option<mpsc::Sender<AudioFrame>>,
    audio_out: mpsc::Receiver<AudioFrame>,
    control: mpsc::Sender<LegControl>,
    events: mpsc::Receiver<SessionEvent>
}

impl std::fmt::Debug for TelephonyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelephonyEndpoint")
            .field("hung_up", &self.audio_in.is_none())
            .finish_non_exhaustive()
    }
}

impl TelephonyEndpoint {
    /// Caller audio into the relay; waits while the queue is full.
    pub async fn send_audio(&self, frame: AudioFrame) -> Result<(), LegClosed> {
        match &self.audio_in {
            Some(tx) => tx.send(frame).await.map_err(|_| LegClosed),
            None => Err(LegClosed)
        }
    }

    /// Audio synthesized by the provider, in order. `None` once the
    /// session has ended.
    pub async fn recv_audio(&mut self) -> Option<AudioFrame> {
        self.audio_out.recv().await
    }

    pub fn try_recv_audio(&mut self) -> Option<AudioFrame> {
        self.audio_out.try_recv().ok()
    }

    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Ask the relay to end the call. Caller audio stops immediately.
    pub async fn hangup(&mut self) -> Result<(), LegClosed> {
        self.audio_in = None;
        self.control
            .send(LegControl::Hangup)
            .await
            .map_err(|_| LegClosed)
    }

    pub async fn transfer(&self, target: impl Into<String>) -> Result<(), LegClosed> {
        self.control
            .send(LegControl::Transfer {
                target: target.into()
            })
            .await
            .map_err(|_| LegClosed)
    }
}

/// A connected leg/endpoint pair with `capacity` frames of buffering in each
/// direction.
pub fn leg(capacity: usize) -> (TelephonyLeg, TelephonyEndpoint) {
    let capacity = capacity.max(1);
    let (audio_in_tx, audio_in_rx) = mpsc::channel(capacity);
    let (audio_out_tx, audio_out_rx) = mpsc::channel(capacity);
    let (control_tx, control_rx) = mpsc::channel(4);
    let (events_tx, events_rx) = mpsc::channel(capacity);

    (
        TelephonyLeg {
            inbound: audio_in_rx,
            outbound: audio_out_tx,
            control: control_rx,
            events: events_tx
        },
        TelephonyEndpoint {
            audio_in: Some(audio_in_tx),
            audio_out: audio_out_rx,
            control: control_tx,
            events: events_rx
        }
    )
}

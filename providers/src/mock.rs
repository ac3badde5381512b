//! Scriptable in-process provider.
//!
//! Every transport opened by a [`MockConnector`] shares one record of sent
//! frames, so a test can check delivery order across reconnects.

use crate::transport::{Connected, InboundEvent, ProviderTransport, TransportConnector};
use async_trait::async_trait;
use errors::TransportError;
use parking_lot::Mutex;
use relay_core::{AudioFrame, SessionConfig};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

/// What the next `connect` call does.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    Succeed,
    Fail(TransportError),
    /// Never completes; exercises handshake timeouts
    Hang
}

enum Signal {
    Event(InboundEvent),
    Fail(TransportError),
    Close
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<ConnectOutcome>>,
    fallback: Mutex<Option<ConnectOutcome>>,
    connects: AtomicU32,
    sessions: Mutex<Vec<SessionConfig>>,
    sent: Mutex<Vec<AudioFrame>>,
    function_results: Mutex<Vec<(String, Value)>>,
    current: Mutex<Option<MockTransportHandle>>,
    ping_fails: AtomicBool
}

#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("connects", &self.connect_count())
            .finish_non_exhaustive()
    }
}

impl MockConnector {
    /// Connector whose connects succeed unless scripted otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted connect.
    pub fn push_outcome(&self, outcome: ConnectOutcome) {
        self.shared.script.lock().push_back(outcome);
    }

    /// Outcome used once the script is exhausted.
    pub fn set_default(&self, outcome: ConnectOutcome) {
        *self.shared.fallback.lock() = Some(outcome);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.shared.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Session configurations seen by every connect, in order.
    pub fn sessions(&self) -> Vec<SessionConfig> {
        self.shared.sessions.lock().clone()
    }

    pub fn sent_frames(&self) -> Vec<AudioFrame> {
        self.shared.sent.lock().clone()
    }

    pub fn sent_sequences(&self) -> Vec<u64> {
        self.shared.sent.lock().iter().map(AudioFrame::sequence).collect()
    }

    pub fn function_results(&self) -> Vec<(String, Value)> {
        self.shared.function_results.lock().clone()
    }

    /// Control handle of the most recently opened transport.
    pub fn handle(&self) -> Option<MockTransportHandle> {
        self.shared.current.lock().clone()
    }

    fn next_outcome(&self) -> ConnectOutcome {
        if let Some(outcome) = self.shared.script.lock().pop_front() {
            return outcome;
        }
        self.shared
            .fallback
            .lock()
            .clone()
            .unwrap_or(ConnectOutcome::Succeed)
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn connect(&self, session: &SessionConfig) -> Result<Connected, TransportError> {
        let attempt = self.shared.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.sessions.lock().push(session.clone());

        match self.next_outcome() {
            ConnectOutcome::Succeed => {
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = MockTransportHandle {
                    signals: tx,
                    fail_sends: Arc::new(AtomicBool::new(false)),
                    closed: Arc::new(AtomicBool::new(false))
                };
                let transport = MockTransport {
                    signals: rx,
                    handle: handle.clone(),
                    shared: Arc::clone(&self.shared)
                };
                *self.shared.current.lock() = Some(handle);
                Ok(Connected {
                    transport: Box::new(transport),
                    session_id: Some(format!("mock-session-{attempt}"))
                })
            }
            ConnectOutcome::Fail(e) => Err(e),
            ConnectOutcome::Hang => std::future::pending().await
        }
    }
}

/// Drives one mock transport from a test.
#[derive(Clone)]
pub struct MockTransportHandle {
    signals: mpsc::UnboundedSender<Signal>,
    fail_sends: Arc<AtomicBool>,
    closed: Arc<AtomicBool>
}

impl MockTransportHandle {
    /// Deliver an inbound event as if the provider sent it.
    pub fn push_event(&self, event: InboundEvent) {
        let _ = self.signals.send(Signal::Event(event));
    }

    /// Make the next `recv` fail with `error`.
    pub fn fail(&self, error: TransportError) {
        let _ = self.signals.send(Signal::Fail(error));
    }

    /// Close the stream from the provider side.
    pub fn close(&self) {
        let _ = self.signals.send(Signal::Close);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Whether the connection closed this transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    signals: mpsc::UnboundedReceiver<Signal>,
    handle: MockTransportHandle,
    shared: Arc<Shared>
}

impl MockTransport {
    fn check_send(&self) -> Result<(), TransportError> {
        if self.handle.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.handle.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send {
                reason: "mock send failure".to_string()
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    async fn send_audio(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        self.check_send()?;
        self.shared.sent.lock().push(frame.clone());
        Ok(())
    }

    async fn send_function_result(
        &mut self,
        call_id: &str,
        output: &Value
    ) -> Result<(), TransportError> {
        self.check_send()?;
        self.shared
            .function_results
            .lock()
            .push((call_id.to_string(), output.clone()));
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent, TransportError>> {
        match self.signals.recv().await? {
            Signal::Event(event) => Some(Ok(event)),
            Signal::Fail(e) => Some(Err(e)),
            Signal::Close => None
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.shared.ping_fails.load(Ordering::SeqCst) {
            return Err(TransportError::Protocol {
                reason: "ping unanswered".to_string()
            });
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

//! Provider connection with automatic reconnection.
//!
//! A [`ProviderConnection`] is a handle. The live transport, the replay
//! buffer and the connection state are owned by one driver task; the handle
//! talks to it over a bounded command queue and observes it through watch
//! channels. Events flow back to the owner over a bounded event queue.

use crate::circuit_breaker::CircuitBreaker;
use crate::events::ConnectionEvent;
use crate::policy::{ConnectionSettings, ReconnectPolicy};
use crate::replay::ReplayBuffer;
use crate::telemetry::ConnectionTelemetry;
use crate::transport::{
    Connected, DisconnectCause, InboundEvent, ProviderTransport, TransportConnector
};
use errors::{ConnectionError, TransportError};
use parking_lot::Mutex;
use relay_core::{AudioFrame, ConnectionState, ProviderId, SessionConfig};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Everything needed to open one provider connection.
pub struct ConnectionContext {
    pub provider: ProviderId,
    pub connector: Arc<dyn TransportConnector>,
    /// Replayed verbatim on every reconnect
    pub session: Arc<SessionConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub policy: Arc<dyn ReconnectPolicy>,
    pub settings: ConnectionSettings,
    /// `None` for providers that keep their own context across reconnects;
    /// their audio is dropped while the connection is not ready.
    pub replay_capacity: Option<usize>
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_buffered: u64,
    pub frames_replayed: u64,
    pub frames_dropped: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    /// False once the connection went quiet for longer than the stale limit
    pub healthy: bool
}

#[derive(Debug, Default)]
struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_buffered: AtomicU64,
    frames_replayed: AtomicU64,
    frames_dropped: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    healthy: AtomicBool
}

impl StatsCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_buffered: self.frames_buffered.load(Ordering::Relaxed),
            frames_replayed: self.frames_replayed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed)
        }
    }
}

enum Command {
    Audio(AudioFrame),
    FunctionResult { call_id: String, output: Value },
    Reconnect
}

pub struct ProviderConnection {
    provider: ProviderId,
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    session_rx: watch::Receiver<Option<String>>,
    stats: Arc<StatsCounters>,
    should_reconnect: Arc<AtomicBool>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
    telemetry: ConnectionTelemetry
}

impl std::fmt::Debug for ProviderConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConnection")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProviderConnection {
    /// Connect and run the setup handshake, then hand the live transport
    /// to a driver task.
    ///
    /// The first connect goes through the provider's breaker like every
    /// later attempt; a rejection or a failed handshake is returned here and
    /// no task is spawned.
    pub async fn open(
        ctx: ConnectionContext
    ) -> Result<(Self, mpsc::Receiver<ConnectionEvent>), ConnectionError> {
        let telemetry = ConnectionTelemetry;
        let provider = ctx.provider.clone();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        state_tx.send_replace(ConnectionState::Connecting);
        telemetry.record_state(&provider, ConnectionState::Connecting);

        let connected = {
            let breaker = Arc::clone(&ctx.breaker);
            let permit = breaker.acquire().map_err(|rejected| {
                state_tx.send_replace(ConnectionState::Error);
                telemetry.record_state(&provider, ConnectionState::Error);
                ConnectionError::BreakerOpen {
                    provider: provider.to_string(),
                    retry_after_ms: rejected.retry_after.as_millis() as u64
                }
            })?;

            let timeout = ctx.settings.handshake_timeout;
            let outcome = match tokio::time::timeout(timeout, ctx.connector.connect(&ctx.session))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::HandshakeTimeout {
                    timeout_ms: timeout.as_millis() as u64
                })
            };

            match outcome {
                Ok(connected) => {
                    permit.success();
                    connected
                }
                Err(e) => {
                    permit.failure();
                    state_tx.send_replace(ConnectionState::Error);
                    telemetry.record_state(&provider, ConnectionState::Error);
                    warn!(provider = %provider, error = %e, "Provider connect failed");
                    return Err(ConnectionError::Transport {
                        provider: provider.to_string(),
                        source: e
                    });
                }
            }
        };

        let (command_tx, command_rx) = mpsc::channel(ctx.settings.command_queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(ctx.settings.event_queue_capacity.max(1));
        let (session_tx, session_rx) = watch::channel(connected.session_id.clone());
        let stats = Arc::new(StatsCounters::default());
        stats.healthy.store(true, Ordering::Relaxed);
        let should_reconnect = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        state_tx.send_replace(ConnectionState::Connected);
        telemetry.record_state(&provider, ConnectionState::Connected);
        info!(
            provider = %provider,
            session_id = connected.session_id.as_deref().unwrap_or("-"),
            "Provider connection established"
        );
        let _ = event_tx.try_send(ConnectionEvent::Connected {
            session_id: connected.session_id
        });

        let driver = Driver {
            provider: provider.clone(),
            connector: ctx.connector,
            session: ctx.session,
            breaker: ctx.breaker,
            policy: ctx.policy,
            settings: ctx.settings,
            transport: Some(connected.transport),
            replay: ctx.replay_capacity.map(ReplayBuffer::new),
            commands: command_rx,
            events: event_tx,
            state_tx,
            session_tx,
            stats: Arc::clone(&stats),
            should_reconnect: Arc::clone(&should_reconnect),
            cancel: cancel.clone(),
            last_message_at: Instant::now(),
            telemetry
        };
        let handle = tokio::spawn(driver.run());

        Ok((
            Self {
                provider,
                commands: command_tx,
                state_rx,
                session_rx,
                stats,
                should_reconnect,
                cancel,
                driver: Mutex::new(Some(handle)),
                telemetry
            },
            event_rx
        ))
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Provider session identifier. May change across a reconnect.
    pub fn session_id(&self) -> Option<String> {
        self.session_rx.borrow().clone()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// Queue a frame toward the provider without waiting.
    ///
    /// Frames sent while the connection is not ready are buffered for
    /// replay. A full command queue drops the frame. Fails only once the
    /// connection has been torn down.
    pub fn send_audio(&self, frame: AudioFrame) -> Result<(), ConnectionError> {
        match self.commands.try_send(Command::Audio(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                StatsCounters::add(&self.stats.frames_dropped, 1);
                self.telemetry.record_frames(&self.provider, "dropped", 1);
                trace!(provider = %self.provider, "Command queue full, audio frame dropped");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(self.disconnected())
        }
    }

    pub async fn send_function_result(
        &self,
        call_id: impl Into<String>,
        output: Value
    ) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::FunctionResult {
                call_id: call_id.into(),
                output
            })
            .await
            .map_err(|_| self.disconnected())
    }

    /// Start a fresh reconnect cycle. The way out of `error`.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.commands
            .send(Command::Reconnect)
            .await
            .map_err(|_| self.disconnected())
    }

    /// Tear the connection down for good.
    ///
    /// Reconnection is disabled before anything else, so an in-flight
    /// backoff or connect attempt is abandoned rather than completed.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.cancel.cancel();

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(provider = %self.provider, error = %e, "Connection driver ended abnormally");
            }
        }
    }

    fn disconnected(&self) -> ConnectionError {
        ConnectionError::Disconnected {
            provider: self.provider.to_string()
        }
    }
}

impl Drop for ProviderConnection {
    fn drop(&mut self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

enum ConnectAttempt {
    Connected(Connected),
    Failed(TransportError),
    Cancelled
}

struct Driver {
    provider: ProviderId,
    connector: Arc<dyn TransportConnector>,
    session: Arc<SessionConfig>,
    breaker: Arc<CircuitBreaker>,
    policy: Arc<dyn ReconnectPolicy>,
    settings: ConnectionSettings,
    transport: Option<Box<dyn ProviderTransport>>,
    replay: Option<ReplayBuffer>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<String>>,
    stats: Arc<StatsCounters>,
    should_reconnect: Arc<AtomicBool>,
    cancel: CancellationToken,
    last_message_at: Instant,
    telemetry: ConnectionTelemetry
}

async fn next_inbound(
    transport: &mut Option<Box<dyn ProviderTransport>>
) -> Option<Result<InboundEvent, TransportError>> {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await
    }
}

impl Driver {
    async fn run(mut self) {
        let mut health = tokio::time::interval_at(
            Instant::now() + self.settings.health_check_interval,
            self.settings.health_check_interval
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let cause = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break
                },
                inbound = next_inbound(&mut self.transport) => self.handle_inbound(inbound).await,
                _ = health.tick() => self.check_health().await
            };

            if let Some(cause) = cause {
                if !self.should_reconnect.load(Ordering::SeqCst) {
                    break;
                }
                self.reconnect(cause).await;
            }
        }

        self.shutdown().await;
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            self.telemetry.record_state(&self.provider, state);
            debug!(
                provider = %self.provider,
                from = %previous,
                to = %state,
                "Connection state changed"
            );
        }
    }

    async fn emit(&mut self, event: ConnectionEvent) {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    trace!(provider = %self.provider, "Event receiver dropped");
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> Option<DisconnectCause> {
        match command {
            Command::Audio(frame) => self.forward_audio(frame).await,
            Command::FunctionResult { call_id, output } => {
                let ready = self.state().is_ready();
                match self.transport.as_mut() {
                    Some(transport) if ready => transport
                        .send_function_result(&call_id, &output)
                        .await
                        .err()
                        .map(DisconnectCause::Transport),
                    _ => {
                        warn!(
                            provider = %self.provider,
                            call_id = %call_id,
                            "Function result dropped, connection not ready"
                        );
                        None
                    }
                }
            }
            Command::Reconnect => {
                info!(provider = %self.provider, "Explicit reconnect requested");
                Some(DisconnectCause::Manual)
            }
        }
    }

    async fn forward_audio(&mut self, frame: AudioFrame) -> Option<DisconnectCause> {
        let state = self.state();
        let Some(transport) = self.transport.as_mut().filter(|_| state.is_ready()) else {
            self.buffer_frame(frame);
            return None;
        };

        match transport.send_audio(&frame).await {
            Ok(()) => {
                StatsCounters::add(&self.stats.frames_sent, 1);
                self.telemetry.record_frames(&self.provider, "sent", 1);
                if state == ConnectionState::Connected {
                    self.set_state(ConnectionState::Active);
                }
                None
            }
            Err(e) => {
                self.buffer_frame(frame);
                Some(DisconnectCause::Transport(e))
            }
        }
    }

    fn buffer_frame(&mut self, frame: AudioFrame) {
        // Only a reconnect in progress may replay; after `error` nothing will.
        if matches!(
            self.state(),
            ConnectionState::Error | ConnectionState::Disconnected
        ) {
            self.record_dropped(1);
            trace!(
                provider = %self.provider,
                seq = frame.sequence(),
                "Audio dropped, connection failed"
            );
            return;
        }

        match self.replay.as_mut() {
            Some(buffer) => {
                StatsCounters::add(&self.stats.frames_buffered, 1);
                self.telemetry.record_frames(&self.provider, "buffered", 1);
                if buffer.push(frame) {
                    self.record_dropped(1);
                }
            }
            None => {
                self.record_dropped(1);
                trace!(
                    provider = %self.provider,
                    seq = frame.sequence(),
                    "Audio dropped while not ready"
                );
            }
        }
    }

    fn record_dropped(&self, frames: u64) {
        if frames == 0 {
            return;
        }
        StatsCounters::add(&self.stats.frames_dropped, frames);
        self.telemetry.record_frames(&self.provider, "dropped", frames);
    }

    async fn handle_inbound(
        &mut self,
        inbound: Option<Result<InboundEvent, TransportError>>
    ) -> Option<DisconnectCause> {
        let event = match inbound {
            None => return Some(DisconnectCause::Closed),
            Some(Err(TransportError::RateLimited { retry_after_secs })) => {
                return Some(DisconnectCause::RateLimited {
                    retry_after: retry_after_secs.map(Duration::from_secs)
                });
            }
            Some(Err(e)) => return Some(DisconnectCause::Transport(e)),
            Some(Ok(event)) => event
        };

        self.last_message_at = Instant::now();
        self.stats.healthy.store(true, Ordering::Relaxed);

        match event {
            InboundEvent::Audio(frame) => {
                StatsCounters::add(&self.stats.frames_received, 1);
                self.telemetry.record_frames(&self.provider, "received", 1);
                self.emit(ConnectionEvent::Audio(frame)).await;
            }
            InboundEvent::Transcript { text, is_final } => {
                self.emit(ConnectionEvent::Transcript { text, is_final })
                    .await;
            }
            InboundEvent::FunctionCall {
                call_id,
                name,
                arguments
            } => {
                self.emit(ConnectionEvent::FunctionCall {
                    call_id,
                    name,
                    arguments
                })
                .await;
            }
            InboundEvent::RateLimited { retry_after_secs } => {
                return Some(DisconnectCause::RateLimited {
                    retry_after: retry_after_secs.map(Duration::from_secs)
                });
            }
            InboundEvent::SessionUpdated { session_id } => {
                self.session_tx.send_replace(Some(session_id));
            }
            InboundEvent::ProviderError { message } => {
                warn!(provider = %self.provider, message = %message, "Provider reported an error");
                self.emit(ConnectionEvent::ProviderError { message }).await;
            }
            InboundEvent::Heartbeat => {}
        }
        None
    }

    /// Quiet connections are probed; only a failed probe counts as loss.
    async fn check_health(&mut self) -> Option<DisconnectCause> {
        if !self.state().is_ready() || self.last_message_at.elapsed() < self.settings.stale_after {
            return None;
        }
        self.stats.healthy.store(false, Ordering::Relaxed);

        let transport = self.transport.as_mut()?;
        match transport.ping().await {
            Ok(()) => {
                debug!(provider = %self.provider, "Connection quiet but answering pings");
                None
            }
            Err(e) => {
                warn!(
                    provider = %self.provider,
                    error = %e,
                    "Stale connection failed liveness probe"
                );
                Some(DisconnectCause::Stale)
            }
        }
    }

    async fn close_transport(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        match tokio::time::timeout(self.settings.handshake_timeout, transport.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(provider = %self.provider, error = %e, "Transport close failed"),
            Err(_) => debug!(provider = %self.provider, "Transport close timed out")
        }
    }

    /// Run reconnect cycles until one succeeds with its replay delivered,
    /// exhausts its attempts or is cancelled.
    async fn reconnect(&mut self, cause: DisconnectCause) {
        let mut next = Some(cause);
        while let Some(cause) = next.take() {
            if self.cancel.is_cancelled() || !self.should_reconnect.load(Ordering::SeqCst) {
                return;
            }
            next = self.reconnect_cycle(cause).await;
        }
    }

    async fn reconnect_cycle(&mut self, cause: DisconnectCause) -> Option<DisconnectCause> {
        warn!(provider = %self.provider, cause = %cause, "Provider connection lost");
        self.close_transport().await;
        self.set_state(ConnectionState::Reconnecting);
        let previous_session = self.session_tx.borrow().clone();

        if let Some(delay) = self.policy.pre_reconnect_delay(&cause) {
            info!(
                provider = %self.provider,
                wait_ms = delay.as_millis() as u64,
                policy = self.policy.name(),
                "Waiting before reconnect"
            );
            if !self.pause(delay).await {
                return None;
            }
        }

        let max_attempts = self.settings.max_attempts;
        for attempt in 1..=max_attempts {
            let backoff = self.policy.backoff(attempt, &self.settings);
            let buffered_frames = self.replay.as_ref().map_or(0, ReplayBuffer::len);
            warn!(
                provider = %self.provider,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                buffered_frames,
                "Reconnecting"
            );
            StatsCounters::add(&self.stats.reconnect_attempts, 1);
            self.telemetry.record_reconnect(&self.provider, "attempt");
            self.emit(ConnectionEvent::Reconnecting {
                attempt,
                max_attempts,
                backoff,
                buffered_frames
            })
            .await;

            if !self.pause(backoff).await {
                return None;
            }

            let breaker = Arc::clone(&self.breaker);
            let permit = match breaker.acquire() {
                Ok(permit) => permit,
                Err(rejected) => {
                    let reason = format!(
                        "circuit breaker open, retry after {}ms",
                        rejected.retry_after.as_millis()
                    );
                    self.fail(reason, attempt - 1).await;
                    return None;
                }
            };

            match self.connect_once().await {
                ConnectAttempt::Cancelled => return None,
                ConnectAttempt::Failed(e) => {
                    permit.failure();
                    warn!(
                        provider = %self.provider,
                        attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
                ConnectAttempt::Connected(connected) => {
                    permit.success();
                    return self
                        .on_reconnected(connected, attempt, previous_session)
                        .await;
                }
            }
        }

        self.fail(
            format!("reconnect attempts exhausted after {max_attempts} tries"),
            max_attempts
        )
        .await;
        None
    }

    /// Sleep while still buffering outbound audio. Returns `false` when the
    /// connection was cancelled meanwhile.
    async fn pause(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(Command::Audio(frame)) => self.buffer_frame(frame),
                    Some(Command::FunctionResult { call_id, .. }) => {
                        warn!(
                            provider = %self.provider,
                            call_id = %call_id,
                            "Function result dropped during reconnect"
                        );
                    }
                    Some(Command::Reconnect) => {}
                    None => return false
                }
            }
        }
    }

    async fn connect_once(&mut self) -> ConnectAttempt {
        let timeout = self.settings.handshake_timeout;
        let attempt = tokio::time::timeout(timeout, self.connector.connect(&self.session));

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => ConnectAttempt::Cancelled,
            result = attempt => match result {
                Ok(Ok(connected)) => ConnectAttempt::Connected(connected),
                Ok(Err(e)) => ConnectAttempt::Failed(e),
                Err(_) => ConnectAttempt::Failed(TransportError::HandshakeTimeout {
                    timeout_ms: timeout.as_millis() as u64
                })
            }
        }
    }

    async fn on_reconnected(
        &mut self,
        connected: Connected,
        attempt: u32,
        previous_session: Option<String>
    ) -> Option<DisconnectCause> {
        let session_id = connected.session_id;
        self.transport = Some(connected.transport);
        self.last_message_at = Instant::now();
        self.stats.healthy.store(true, Ordering::Relaxed);
        self.session_tx.send_replace(session_id.clone());
        self.policy
            .after_reconnect(&self.provider, previous_session.as_deref(), session_id.as_deref());

        StatsCounters::add(&self.stats.reconnects, 1);
        self.telemetry.record_reconnect(&self.provider, "success");

        let pending = self.replay.as_ref().map_or(0, ReplayBuffer::len);
        info!(provider = %self.provider, attempt, replay_frames = pending, "Reconnected");
        self.emit(ConnectionEvent::Reconnected {
            attempt,
            session_id,
            replayed_frames: pending
        })
        .await;

        if let Err(e) = self.replay_buffered().await {
            return Some(DisconnectCause::Transport(e));
        }
        self.set_state(ConnectionState::Connected);
        None
    }

    /// Deliver buffered frames in order. Frames that could not be sent go
    /// back to the front of the buffer.
    async fn replay_buffered(&mut self) -> Result<usize, TransportError> {
        let (Some(buffer), Some(transport)) = (self.replay.as_mut(), self.transport.as_mut())
        else {
            return Ok(0);
        };

        let mut frames = buffer.drain().into_iter();
        let mut sent = 0usize;
        let mut lost = 0usize;
        let mut failure = None;
        while let Some(frame) = frames.next() {
            if let Err(e) = transport.send_audio(&frame).await {
                let mut unsent = vec![frame];
                unsent.extend(frames.by_ref());
                lost = buffer.restore_front(unsent);
                failure = Some(e);
                break;
            }
            sent += 1;
        }

        self.record_dropped(lost as u64);
        StatsCounters::add(&self.stats.frames_replayed, sent as u64);
        StatsCounters::add(&self.stats.frames_sent, sent as u64);
        self.telemetry.record_frames(&self.provider, "replayed", sent as u64);
        self.telemetry.record_frames(&self.provider, "sent", sent as u64);

        match failure {
            Some(e) => {
                warn!(provider = %self.provider, replayed = sent, error = %e, "Replay interrupted");
                Err(e)
            }
            None => Ok(sent)
        }
    }

    async fn fail(&mut self, reason: String, attempts: u32) {
        error!(
            provider = %self.provider,
            attempts,
            reason = %reason,
            "Provider connection failed, automatic reconnect stopped"
        );
        self.telemetry.record_reconnect(&self.provider, "exhausted");
        let discarded = self.replay.as_mut().map_or(0, ReplayBuffer::clear);
        self.record_dropped(discarded as u64);
        self.set_state(ConnectionState::Error);
        self.emit(ConnectionEvent::Failed { reason, attempts }).await;
    }

    async fn shutdown(&mut self) {
        self.close_transport().await;
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.try_send(ConnectionEvent::Disconnected);
        info!(provider = %self.provider, "Provider connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::mock::{ConnectOutcome, MockConnector};
    use crate::policy::{RateLimitAwarePolicy, StandardPolicy};
    use relay_core::AudioFormat;

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0u8; 160], AudioFormat::telephony(), seq)
    }

    fn lenient_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "mock",
            CircuitBreakerConfig {
                failure_threshold: 50,
                ..CircuitBreakerConfig::default()
            }
        ))
    }

    fn context(connector: &MockConnector, replay_capacity: Option<usize>) -> ConnectionContext {
        ConnectionContext {
            provider: ProviderId::new("mock"),
            connector: Arc::new(connector.clone()),
            session: Arc::new(SessionConfig::new("mock", "mock-model").with_instructions("hi")),
            breaker: lenient_breaker(),
            policy: Arc::new(StandardPolicy),
            settings: ConnectionSettings::default(),
            replay_capacity
        }
    }

    async fn open(ctx: ConnectionContext) -> (ProviderConnection, mpsc::Receiver<ConnectionEvent>) {
        let (connection, mut events) = ProviderConnection::open(ctx).await.unwrap();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Connected { .. })
        ));
        (connection, events)
    }

    async fn wait_ready(connection: &ProviderConnection) {
        let mut state = connection.subscribe_state();
        state.wait_for(|s| s.is_ready()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnect_emits_single_failed_event() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, Some(100))).await;

        connector.set_default(ConnectOutcome::Fail(TransportError::Connect {
            endpoint: "mock".into(),
            reason: "refused".into()
        }));
        let started = Instant::now();
        connector.handle().unwrap().close();

        let mut backoffs = Vec::new();
        let attempts = loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Reconnecting {
                    attempt,
                    max_attempts,
                    backoff,
                    ..
                } => {
                    assert_eq!(attempt as usize, backoffs.len() + 1);
                    assert_eq!(max_attempts, 5);
                    backoffs.push(backoff.as_secs());
                }
                ConnectionEvent::Failed { attempts, .. } => break attempts,
                other => panic!("unexpected event {other:?}")
            }
        };

        assert_eq!(attempts, 5);
        assert_eq!(backoffs, vec![1, 2, 4, 8, 16]);
        assert!(started.elapsed() >= Duration::from_secs(31));
        assert_eq!(connection.state(), ConnectionState::Error);
        assert_eq!(connector.connect_count(), 6);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(connector.connect_count(), 6);
        assert_eq!(connection.connection_stats().reconnect_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_audio_replayed_in_order_after_reconnect() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, Some(3))).await;

        connector.handle().unwrap().close();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { attempt: 1, .. })
        ));

        for seq in 1..=5 {
            connection.send_audio(frame(seq)).unwrap();
        }

        match events.recv().await.unwrap() {
            ConnectionEvent::Reconnected {
                attempt,
                session_id,
                replayed_frames
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(replayed_frames, 3);
                assert_eq!(session_id.as_deref(), Some("mock-session-2"));
            }
            other => panic!("unexpected event {other:?}")
        }
        wait_ready(&connection).await;

        connection.send_audio(frame(6)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(connector.sent_sequences(), vec![3, 4, 5, 6]);
        assert_eq!(connection.session_id().as_deref(), Some("mock-session-2"));
        let stats = connection.connection_stats();
        assert_eq!(stats.frames_replayed, 3);
        assert_eq!(stats.frames_dropped, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(connection.state(), ConnectionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_connection_drops_audio_while_reconnecting() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, None)).await;

        connector.handle().unwrap().close();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { buffered_frames: 0, .. })
        ));
        for seq in 1..=4 {
            connection.send_audio(frame(seq)).unwrap();
        }

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnected { replayed_frames: 0, .. })
        ));
        wait_ready(&connection).await;

        assert!(connector.sent_frames().is_empty());
        assert_eq!(connection.connection_stats().frames_dropped, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_backoff() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, Some(10))).await;

        connector.handle().unwrap().close();
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { attempt: 1, .. })
        ));

        let started = Instant::now();
        connection.disconnect().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connect_count(), 1);
        assert!(matches!(
            connection.send_audio(frame(1)),
            Err(ConnectionError::Disconnected { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_reconnect_recovers_from_error() {
        let connector = MockConnector::new();
        let mut ctx = context(&connector, Some(10));
        ctx.settings.max_attempts = 2;
        let (connection, mut events) = open(ctx).await;

        connector.set_default(ConnectOutcome::Fail(TransportError::Closed));
        connector.handle().unwrap().close();
        loop {
            if let Some(ConnectionEvent::Failed { attempts, .. }) = events.recv().await {
                assert_eq!(attempts, 2);
                break;
            }
        }
        assert_eq!(connection.state(), ConnectionState::Error);

        connector.set_default(ConnectOutcome::Succeed);
        connection.reconnect().await.unwrap();
        loop {
            if let Some(ConnectionEvent::Reconnected { attempt, .. }) = events.recv().await {
                assert_eq!(attempt, 1);
                break;
            }
        }
        wait_ready(&connection).await;
        assert_eq!(connector.sessions().len(), 4);
        assert!(
            connector
                .sessions()
                .iter()
                .all(|s| s.instructions == "hi")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_sent_after_failure_is_not_replayed() {
        let connector = MockConnector::new();
        let mut ctx = context(&connector, Some(10));
        ctx.settings.max_attempts = 1;
        let (connection, mut events) = open(ctx).await;

        connector.set_default(ConnectOutcome::Fail(TransportError::Closed));
        connector.handle().unwrap().close();
        loop {
            if let Some(ConnectionEvent::Failed { .. }) = events.recv().await {
                break;
            }
        }
        assert_eq!(connection.state(), ConnectionState::Error);

        for seq in 100..=102 {
            connection.send_audio(frame(seq)).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(600)).await;

        connector.set_default(ConnectOutcome::Succeed);
        connection.reconnect().await.unwrap();
        loop {
            if let Some(ConnectionEvent::Reconnected {
                replayed_frames, ..
            }) = events.recv().await
            {
                assert_eq!(replayed_frames, 0);
                break;
            }
        }
        wait_ready(&connection).await;

        assert!(connector.sent_sequences().is_empty());
        assert_eq!(connection.connection_stats().frames_dropped, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_signal_delays_reconnect() {
        let connector = MockConnector::new();
        let mut ctx = context(&connector, Some(10));
        ctx.policy = Arc::new(RateLimitAwarePolicy::new(Duration::from_secs(60)));
        let (_connection, mut events) = open(ctx).await;

        let started = Instant::now();
        connector.handle().unwrap().push_event(InboundEvent::RateLimited {
            retry_after_secs: Some(10)
        });

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { attempt: 1, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnected { .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_with_failed_ping_reconnects() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, Some(10))).await;
        let started = Instant::now();
        connector.set_ping_fails(true);

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnecting { attempt: 1, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(!connection.connection_stats().healthy);
        assert!(connector.handle().unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_connection_answering_pings_stays_up() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, Some(10))).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_inbound_events_reach_owner() {
        let connector = MockConnector::new();
        let (connection, mut events) = open(context(&connector, None)).await;
        let handle = connector.handle().unwrap();

        handle.push_event(InboundEvent::Audio(frame(9)));
        handle.push_event(InboundEvent::FunctionCall {
            call_id: "fc1".into(),
            name: "lookup".into(),
            arguments: serde_json::json!({"order": 42})
        });
        handle.push_event(InboundEvent::SessionUpdated {
            session_id: "renamed".into()
        });
        handle.push_event(InboundEvent::Transcript {
            text: "hello".into(),
            is_final: true
        });

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Audio(f)) if f.sequence() == 9
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::FunctionCall { name, .. }) if name == "lookup"
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Transcript { is_final: true, .. })
        ));
        assert_eq!(connection.session_id().as_deref(), Some("renamed"));
        assert_eq!(connection.connection_stats().frames_received, 1);

        connection
            .send_function_result("fc1", serde_json::json!({"status": "shipped"}))
            .await
            .unwrap();
        connection.send_audio(frame(1)).unwrap();
        let mut state = connection.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Active)
            .await
            .unwrap();
        connection.disconnect().await;

        assert_eq!(connector.function_results().len(), 1);
        assert_eq!(connector.sent_sequences(), vec![1]);
        assert!(handle.is_closed());
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_open_rejected_by_open_breaker() {
        let connector = MockConnector::new();
        let ctx = context(&connector, None);
        ctx.breaker.force_open();

        let err = ProviderConnection::open(ctx).await.unwrap_err();
        assert!(matches!(err, ConnectionError::BreakerOpen { .. }));
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out_hung_handshake() {
        let connector = MockConnector::new();
        connector.push_outcome(ConnectOutcome::Hang);
        let ctx = context(&connector, None);
        let breaker = Arc::clone(&ctx.breaker);

        let err = ProviderConnection::open(ctx).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Transport {
                source: TransportError::HandshakeTimeout { timeout_ms: 10_000 },
                ..
            }
        ));
        assert_eq!(breaker.snapshot().failed_calls, 1);
    }
}

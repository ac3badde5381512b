//! Session orchestration.
//!
//! One session binds one telephony leg to one provider connection for the
//! lifetime of a call. Each session runs as a single task that pumps audio
//! in both directions and reacts to connection events; the connection's own
//! driver task handles reconnects underneath it. When a connection gives up,
//! the session fails over to the next capable provider or ends the call
//! with a recorded failure.

use crate::telemetry::SessionTelemetry;
use crate::telephony::{self, LegControl, SessionEvent, TelephonyEndpoint, TelephonyLeg};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{ConnectionError, SessionError};
use parking_lot::{Mutex, RwLock};
use providers::{
    ConnectionContext, ConnectionEvent, ConnectionSettings, ConnectionStats, ProviderConnection,
    ProviderEntry, ProviderRegistry, ProviderRequirements
};
use relay_core::{AudioFrame, CallState, CallStatus, ConnectionState, ProviderId, SessionConfig};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use storage::CallStateStore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Call metadata key holding the bound provider.
pub const PROVIDER_KEY: &str = "provider";
/// Call metadata key holding the provider's own session identifier.
pub const PROVIDER_SESSION_KEY: &str = "provider_session_id";
/// Call metadata key counting provider switches.
pub const FAILOVERS_KEY: &str = "failovers";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub connection: ConnectionSettings,
    /// Replay buffer size for providers that need one
    pub replay_capacity: usize,
    pub audio_queue_capacity: usize,
    pub failover_enabled: bool,
    pub max_failovers: u32
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            replay_capacity: 100,
            audio_queue_capacity: 256,
            failover_enabled: true,
            max_failovers: 2
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &config::Config) -> Self {
        Self {
            connection: ConnectionSettings::from_config(
                &config.reconnect,
                config.session.event_queue_capacity
            ),
            replay_capacity: config.reconnect.replay_buffer_capacity,
            audio_queue_capacity: config.session.audio_queue_capacity,
            failover_enabled: config.session.failover_enabled,
            max_failovers: config.session.max_failovers
        }
    }
}

/// Everything needed to start relaying one call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub call: CallState,
    /// Conversation setup; provider and model are filled in at selection
    pub session: SessionConfig,
    pub requirements: ProviderRequirements
}

impl CallRequest {
    pub fn new(
        call: CallState,
        session: SessionConfig,
        requirements: ProviderRequirements,
    ) -> Self {
        Self {
            call,
            session,
            requirements
        }
    }
}

/// Live view of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub call_id: String,
    pub session_id: Uuid,
    pub provider: ProviderId,
    pub provider_session_id: Option<String>,
    pub connection_state: ConnectionState,
    pub failovers: u32,
    pub started_at: DateTime<Utc>,
    pub stats: ConnectionStats
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub call_id: String,
    pub status: CallStatus,
    pub reason: String,
    /// Last provider the call was bound to
    pub provider: ProviderId,
    pub failovers: u32
}

enum SessionCommand {
    End { reason: String }
}

struct SessionShared {
    call_id: String,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    connection: RwLock<Arc<ProviderConnection>>,
    failovers: AtomicU32
}

impl SessionShared {
    fn connection(&self) -> Arc<ProviderConnection> {
        Arc::clone(&self.connection.read())
    }

    fn status(&self) -> SessionStatus {
        let connection = self.connection();
        SessionStatus {
            call_id: self.call_id.clone(),
            session_id: self.session_id,
            provider: connection.provider().clone(),
            provider_session_id: connection.session_id(),
            connection_state: connection.state(),
            failovers: self.failovers.load(Ordering::Relaxed),
            started_at: self.started_at,
            stats: connection.connection_stats()
        }
    }
}

struct SessionSlot {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<SessionCommand>,
    task: Mutex<Option<JoinHandle<SessionSummary>>>
}

impl SessionSlot {
    async fn join(&self) -> Option<SessionSummary> {
        let handle = self.task.lock().take()?;
        match handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(call_id = %self.shared.call_id, error = %e, "Session task ended abnormally");
                None
            }
        }
    }
}

struct Opened {
    entry: Arc<ProviderEntry>,
    connection: ProviderConnection,
    events: mpsc::Receiver<ConnectionEvent>
}

struct Core {
    registry: Arc<ProviderRegistry>,
    store: Arc<CallStateStore>,
    settings: OrchestratorSettings,
    sessions: DashMap<String, Arc<SessionSlot>>,
    telemetry: SessionTelemetry
}

impl Core {
    /// Connect to the best candidate, moving down the ranking while
    /// connects fail. Every provider tried is added to the exclusions.
    async fn open_provider(
        &self,
        requirements: &mut ProviderRequirements,
        base: &SessionConfig
    ) -> Result<Opened, SessionError> {
        let mut last_error: Option<ConnectionError> = None;

        loop {
            let entry = match self.registry.select_best_provider(requirements) {
                Ok(entry) => entry,
                Err(e) => {
                    return Err(last_error.map_or_else(|| e.into(), SessionError::from));
                }
            };

            let ctx = ConnectionContext {
                provider: entry.id.clone(),
                connector: Arc::clone(&entry.connector),
                session: Arc::new(entry.session_for(base)),
                breaker: Arc::clone(&entry.breaker),
                policy: self.registry.policy_for(&entry),
                settings: self.settings.connection.clone(),
                replay_capacity: entry.replay_capacity(self.settings.replay_capacity)
            };

            match ProviderConnection::open(ctx).await {
                Ok((connection, events)) => {
                    return Ok(Opened {
                        entry,
                        connection,
                        events
                    });
                }
                Err(e) => {
                    warn!(
                        provider = %entry.id,
                        error = %e,
                        "Provider unavailable, trying next candidate"
                    );
                    requirements.exclude.insert(entry.id.clone());
                    last_error = Some(e);
                }
            }
        }
    }

    async fn abandon(&self, call_id: &str, reason: &str) {
        if let Err(e) = self
            .store
            .end_call(call_id, CallStatus::Failed, Some(reason))
            .await
        {
            error!(call_id, error = %e, "Failed to record call failure");
        }
        self.telemetry.record_outcome("failed");
    }

    async fn record_metadata(&self, call_id: &str, entries: HashMap<String, Value>) {
        if let Err(e) = self.store.update_call_metadata(call_id, entries).await {
            warn!(call_id, error = %e, "Failed to update call metadata");
        }
    }
}

fn provider_metadata(
    provider: &ProviderId,
    provider_session: Option<String>,
) -> HashMap<String, Value> {
    HashMap::from([
        (PROVIDER_KEY.to_string(), Value::String(provider.to_string())),
        (
            PROVIDER_SESSION_KEY.to_string(),
            provider_session.map_or(Value::Null, Value::String)
        ),
    ])
}

pub struct SessionOrchestrator {
    core: Arc<Core>,
    shutdown: CancellationToken
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("active_sessions", &self.core.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<CallStateStore>,
        settings: OrchestratorSettings
    ) -> Self {
        Self {
            core: Arc::new(Core {
                registry,
                store,
                settings,
                sessions: DashMap::new(),
                telemetry: SessionTelemetry
            }),
            shutdown: CancellationToken::new()
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.core.registry
    }

    pub fn store(&self) -> &Arc<CallStateStore> {
        &self.core.store
    }

    /// A fresh leg/endpoint pair sized from the orchestrator settings.
    pub fn telephony_leg(&self) -> (TelephonyLeg, TelephonyEndpoint) {
        telephony::leg(self.core.settings.audio_queue_capacity)
    }

    /// Restore visibility of calls that were active before a restart.
    ///
    /// Media streams do not survive a restart, so recovered calls stay
    /// listed without a live session until they are ended.
    pub async fn recover_active_calls(&self) -> Result<Vec<CallState>, SessionError> {
        let calls = self.core.store.recover_active_calls().await?;
        for call in calls
            .iter()
            .filter(|c| !self.core.sessions.contains_key(&c.call_id))
        {
            warn!(
                call_id = %call.call_id,
                status = %call.status,
                "Recovered call has no live session"
            );
        }
        Ok(calls)
    }

    /// Register the call, bind it to the best available provider and start
    /// relaying audio.
    ///
    /// A call that cannot be bound to any provider is recorded as failed and
    /// the error is returned; the call never proceeds.
    pub async fn start_call(
        &self,
        request: CallRequest,
        leg: TelephonyLeg
    ) -> Result<SessionStatus, SessionError> {
        let CallRequest {
            call,
            session,
            mut requirements
        } = request;
        let call_id = call.call_id.clone();

        if self.core.sessions.contains_key(&call_id) {
            return Err(SessionError::AlreadyActive { call_id });
        }

        let call = self.core.store.register_call(call).await?;

        let opened = match self.core.open_provider(&mut requirements, &session).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "No provider could be bound to call");
                self.core.abandon(&call_id, &e.to_string()).await;
                return Err(e);
            }
        };
        let Opened {
            entry,
            connection,
            events
        } = opened;

        let bound = match self
            .core
            .store
            .update_call_status(&call_id, CallStatus::Answered)
            .await
        {
            Ok(_) => {
                self.core
                    .store
                    .update_call_metadata(
                        &call_id,
                        provider_metadata(&entry.id, connection.session_id())
                    )
                    .await
            }
            Err(e) => Err(e)
        };
        if let Err(e) = bound {
            connection.disconnect().await;
            self.core.abandon(&call_id, &e.to_string()).await;
            return Err(e.into());
        }

        leg.notify(SessionEvent::Connected {
            provider: entry.id.clone(),
            session_id: connection.session_id()
        });

        let connection = Arc::new(connection);
        let shared = Arc::new(SessionShared {
            call_id: call_id.clone(),
            session_id: call.session_id,
            started_at: Utc::now(),
            connection: RwLock::new(Arc::clone(&connection)),
            failovers: AtomicU32::new(0)
        });
        let (command_tx, command_rx) = mpsc::channel(4);
        let slot = Arc::new(SessionSlot {
            shared: Arc::clone(&shared),
            commands: command_tx,
            task: Mutex::new(None)
        });

        let runner = SessionRunner {
            core: Arc::clone(&self.core),
            shared: Arc::clone(&shared),
            connection,
            leg,
            events,
            commands: command_rx,
            shutdown: self.shutdown.child_token(),
            requirements,
            base_session: session,
            failovers: 0
        };

        {
            // Held until the task handle is stored so `end_call` cannot race it
            let mut task = slot.task.lock();
            self.core.sessions.insert(call_id.clone(), Arc::clone(&slot));
            *task = Some(tokio::spawn(runner.run()));
        }
        self.core.telemetry.set_active(self.core.sessions.len());

        info!(
            call_id = %call_id,
            session_id = %shared.session_id,
            provider = %entry.id,
            "Session started"
        );
        Ok(shared.status())
    }

    /// End a live session and wait for it to finish. The call is recorded
    /// as completed with `reason`.
    pub async fn end_call(
        &self,
        call_id: &str,
        reason: impl Into<String>
    ) -> Result<SessionSummary, SessionError> {
        let slot = self.slot(call_id)?;
        let _ = slot
            .commands
            .send(SessionCommand::End {
                reason: reason.into()
            })
            .await;
        slot.join().await.ok_or_else(|| SessionError::NotFound {
            call_id: call_id.to_string()
        })
    }

    /// Hand a function-call result back to the call's current provider.
    pub async fn submit_function_result(
        &self,
        call_id: &str,
        function_call_id: &str,
        output: Value
    ) -> Result<(), SessionError> {
        let connection = self.slot(call_id)?.shared.connection();
        connection
            .send_function_result(function_call_id, output)
            .await?;
        Ok(())
    }

    pub fn status(&self, call_id: &str) -> Option<SessionStatus> {
        self.core
            .sessions
            .get(call_id)
            .map(|slot| slot.shared.status())
    }

    /// Every live session, oldest first.
    pub fn active_sessions(&self) -> Vec<SessionStatus> {
        let mut sessions: Vec<SessionStatus> = self
            .core
            .sessions
            .iter()
            .map(|slot| slot.shared.status())
            .collect();
        sessions.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        sessions
    }

    /// End every live session and wait for all of them.
    pub async fn shutdown(&self) -> Vec<SessionSummary> {
        info!(active = self.core.sessions.len(), "Shutting down sessions");
        self.shutdown.cancel();

        let slots: Vec<Arc<SessionSlot>> = self
            .core
            .sessions
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(summary) = slot.join().await {
                summaries.push(summary);
            }
        }
        summaries
    }

    fn slot(&self, call_id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.core
            .sessions
            .get(call_id)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| SessionError::NotFound {
                call_id: call_id.to_string()
            })
    }
}

enum Step {
    Continue,
    End { status: CallStatus, reason: String }
}

impl Step {
    fn end(status: CallStatus, reason: impl Into<String>) -> Self {
        Self::End {
            status,
            reason: reason.into()
        }
    }
}

enum FailoverOutcome {
    Opened(Result<Opened, SessionError>),
    Control(Option<LegControl>),
    Interrupted(Step)
}

struct SessionRunner {
    core: Arc<Core>,
    shared: Arc<SessionShared>,
    connection: Arc<ProviderConnection>,
    leg: TelephonyLeg,
    events: mpsc::Receiver<ConnectionEvent>,
    commands: mpsc::Receiver<SessionCommand>,
    shutdown: CancellationToken,
    requirements: ProviderRequirements,
    base_session: SessionConfig,
    failovers: u32
}

impl SessionRunner {
    async fn run(mut self) -> SessionSummary {
        let (status, reason) = loop {
            let step = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    Step::end(CallStatus::Completed, "relay shutdown")
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::End { reason }) => {
                        Step::end(CallStatus::Completed, reason)
                    }
                    None => Step::end(CallStatus::Completed, "session released")
                },
                control = self.leg.control.recv() => self.on_control(control).await,
                event = self.events.recv() => self.on_provider_event(event).await,
                frame = self.leg.inbound.recv() => self.on_caller_audio(frame)
            };

            if let Step::End { status, reason } = step {
                break (status, reason);
            }
        };

        self.finish(status, reason).await
    }

    fn on_caller_audio(&mut self, frame: Option<AudioFrame>) -> Step {
        let Some(frame) = frame else {
            return Step::end(CallStatus::Completed, "caller hung up");
        };
        if let Err(e) = self.connection.send_audio(frame) {
            debug!(call_id = %self.shared.call_id, error = %e, "Caller audio not forwarded");
        }
        Step::Continue
    }

    async fn on_control(&mut self, control: Option<LegControl>) -> Step {
        match control {
            Some(LegControl::Hangup) | None => Step::end(CallStatus::Completed, "caller hung up"),
            Some(LegControl::Transfer { target }) => {
                if let Err(e) = self
                    .core
                    .store
                    .update_call_status(&self.shared.call_id, CallStatus::Transferring)
                    .await
                {
                    warn!(call_id = %self.shared.call_id, error = %e, "Failed to record transfer");
                }
                Step::end(CallStatus::Completed, format!("transferred to {target}"))
            }
        }
    }

    async fn on_provider_event(&mut self, event: Option<ConnectionEvent>) -> Step {
        let provider = self.connection.provider().clone();
        let Some(event) = event else {
            return Step::end(CallStatus::Failed, format!("provider {provider} connection closed"));
        };

        match event {
            ConnectionEvent::Audio(frame) => {
                self.leg.deliver_audio(frame);
            }
            ConnectionEvent::Transcript { text, is_final } => {
                self.leg
                    .notify(SessionEvent::Transcript { text, is_final });
            }
            ConnectionEvent::FunctionCall {
                call_id,
                name,
                arguments
            } => {
                self.leg.notify(SessionEvent::FunctionCall {
                    call_id,
                    name,
                    arguments
                });
            }
            ConnectionEvent::ProviderError { message } => {
                warn!(
                    call_id = %self.shared.call_id,
                    provider = %provider,
                    detail = %message,
                    "Provider reported an error"
                );
            }
            ConnectionEvent::Connected { .. } => {}
            ConnectionEvent::Reconnecting {
                attempt,
                buffered_frames,
                ..
            } => {
                debug!(
                    call_id = %self.shared.call_id,
                    provider = %provider,
                    attempt,
                    buffered_frames,
                    "Provider reconnecting"
                );
                self.leg
                    .notify(SessionEvent::ProviderReconnecting { provider, attempt });
            }
            ConnectionEvent::Reconnected {
                session_id,
                replayed_frames,
                ..
            } => {
                info!(
                    call_id = %self.shared.call_id,
                    provider = %provider,
                    replayed_frames,
                    "Provider connection restored"
                );
                self.core
                    .record_metadata(
                        &self.shared.call_id,
                        provider_metadata(&provider, session_id.clone())
                    )
                    .await;
                self.leg.notify(SessionEvent::ProviderReconnected {
                    provider,
                    session_id
                });
            }
            ConnectionEvent::Failed { reason, attempts } => {
                warn!(
                    call_id = %self.shared.call_id,
                    provider = %provider,
                    attempts,
                    reason = %reason,
                    "Provider connection failed"
                );
                return self.fail_over(reason).await;
            }
            ConnectionEvent::Disconnected => {
                return Step::end(
                    CallStatus::Failed,
                    format!("provider {provider} connection closed")
                );
            }
        }
        Step::Continue
    }

    /// Move the call to an alternate provider. The new provider starts from
    /// the original conversation setup; context held by the failed provider
    /// is lost.
    async fn fail_over(&mut self, reason: String) -> Step {
        let failed = self.connection.provider().clone();
        if !self.core.settings.failover_enabled
            || self.failovers >= self.core.settings.max_failovers
        {
            return Step::end(CallStatus::Failed, format!("provider {failed} failed: {reason}"));
        }

        self.requirements.exclude.insert(failed.clone());

        // Opening may take a handshake timeout per candidate; the caller and
        // the operator can still end the call meanwhile.
        let core = Arc::clone(&self.core);
        let opening = core.open_provider(&mut self.requirements, &self.base_session);
        let outcome = tokio::select! {
            biased;

            () = self.shutdown.cancelled() => {
                FailoverOutcome::Interrupted(Step::end(CallStatus::Completed, "relay shutdown"))
            }
            command = self.commands.recv() => FailoverOutcome::Interrupted(match command {
                Some(SessionCommand::End { reason }) => Step::end(CallStatus::Completed, reason),
                None => Step::end(CallStatus::Completed, "session released")
            }),
            control = self.leg.control.recv() => FailoverOutcome::Control(control),
            opened = opening => FailoverOutcome::Opened(opened)
        };

        let opened = match outcome {
            FailoverOutcome::Opened(Ok(opened)) => opened,
            FailoverOutcome::Opened(Err(e)) => {
                return Step::end(
                    CallStatus::Failed,
                    format!("provider {failed} failed: {reason}; no alternate provider: {e}")
                );
            }
            FailoverOutcome::Interrupted(step) => {
                info!(
                    call_id = %self.shared.call_id,
                    from = %failed,
                    "Failover abandoned, call ending"
                );
                return step;
            }
            FailoverOutcome::Control(control) => {
                info!(
                    call_id = %self.shared.call_id,
                    from = %failed,
                    "Failover abandoned, call ending"
                );
                return self.on_control(control).await;
            }
        };

        let connection = Arc::new(opened.connection);
        let previous = std::mem::replace(&mut self.connection, Arc::clone(&connection));
        *self.shared.connection.write() = Arc::clone(&connection);
        self.events = opened.events;
        previous.disconnect().await;

        self.failovers += 1;
        self.shared
            .failovers
            .store(self.failovers, Ordering::Relaxed);
        self.core
            .telemetry
            .record_failover(&failed, &opened.entry.id);
        warn!(
            call_id = %self.shared.call_id,
            from = %failed,
            to = %opened.entry.id,
            failovers = self.failovers,
            "Failed over to alternate provider, conversation context reset"
        );

        let mut metadata = provider_metadata(&opened.entry.id, connection.session_id());
        metadata.insert(FAILOVERS_KEY.to_string(), Value::from(self.failovers));
        self.core
            .record_metadata(&self.shared.call_id, metadata)
            .await;

        self.leg.notify(SessionEvent::ProviderSwitched {
            from: failed,
            to: opened.entry.id.clone()
        });
        Step::Continue
    }

    async fn finish(self, status: CallStatus, reason: String) -> SessionSummary {
        let call_id = self.shared.call_id.clone();
        let provider = self.connection.provider().clone();
        self.connection.disconnect().await;

        if let Err(e) = self
            .core
            .store
            .end_call(&call_id, status, Some(&reason))
            .await
        {
            error!(call_id = %call_id, error = %e, "Failed to record end of call");
        }

        self.core.sessions.remove(&call_id);
        self.core
            .telemetry
            .set_active(self.core.sessions.len());
        self.core
            .telemetry
            .record_outcome(if status == CallStatus::Failed { "failed" } else { "completed" });

        if status == CallStatus::Failed {
            error!(call_id = %call_id, provider = %provider, reason = %reason, "Session failed");
        } else {
            info!(call_id = %call_id, provider = %provider, reason = %reason, "Session ended");
        }

        self.leg.notify(SessionEvent::Ended {
            status,
            reason: reason.clone()
        });

        SessionSummary {
            call_id,
            status,
            reason,
            provider,
            failovers: self.failovers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::{SelectionError, TransportError};
    use providers::{CircuitBreakerConfig, ConnectOutcome, InboundEvent, MockConnector};
    use relay_core::{
        AudioEncoding, AudioFormat, CallDirection, CostTier, ProviderCapabilities, ProviderKind
    };
    use std::time::Duration;
    use storage::{CallCache, DurableCallStore, InMemoryCallCache, InMemoryCallStore};

    struct Fixture {
        orchestrator: SessionOrchestrator,
        store: Arc<CallStateStore>,
        cache: Arc<InMemoryCallCache>,
        durable: Arc<InMemoryCallStore>,
        primary: MockConnector,
        backup: MockConnector
    }

    fn capabilities(multimodal: bool, cost_tier: CostTier) -> ProviderCapabilities {
        ProviderCapabilities {
            kind: ProviderKind::Realtime,
            multimodal,
            function_calling: true,
            audio_encodings: vec![AudioEncoding::Mulaw, AudioEncoding::Pcm16],
            cost_tier,
            priority: 0
        }
    }

    fn fixture(with_backup: bool, settings: OrchestratorSettings) -> Fixture {
        let primary = MockConnector::new();
        let backup = MockConnector::new();

        let mut registry = ProviderRegistry::default();
        registry
            .register(ProviderEntry::new(
                "primary",
                "primary-model",
                capabilities(true, CostTier::Premium),
                Arc::new(primary.clone()),
                CircuitBreakerConfig::default()
            ))
            .unwrap();
        if with_backup {
            registry
                .register(ProviderEntry::new(
                    "backup",
                    "backup-model",
                    capabilities(false, CostTier::Standard),
                    Arc::new(backup.clone()),
                    CircuitBreakerConfig::default()
                ))
                .unwrap();
        }

        let cache = Arc::new(InMemoryCallCache::new());
        let durable = Arc::new(InMemoryCallStore::new());
        let store = Arc::new(CallStateStore::new(
            Arc::clone(&durable) as Arc<dyn DurableCallStore>,
            Some(Arc::clone(&cache) as Arc<dyn CallCache>)
        ));

        Fixture {
            orchestrator: SessionOrchestrator::new(
                Arc::new(registry),
                Arc::clone(&store),
                settings,
            ),
            store,
            cache,
            durable,
            primary,
            backup
        }
    }

    fn request(call_id: &str) -> CallRequest {
        CallRequest::new(
            CallState::new(call_id, "twilio", CallDirection::Inbound, "+15550001", "+15550002"),
            SessionConfig::new("unbound", "unbound").with_instructions("You are a receptionist"),
            ProviderRequirements::new(CostTier::Premium)
        )
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![seq as u8; 8], AudioFormat::telephony(), seq)
    }

    async fn next_matching(
        endpoint: &mut TelephonyEndpoint,
        matches: impl Fn(&SessionEvent) -> bool
    ) -> SessionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(600), endpoint.next_event())
                .await
                .expect("timed out waiting for session event")
                .expect("session event queue closed");
            if matches(&event) {
                return event;
            }
        }
    }

    async fn ended(endpoint: &mut TelephonyEndpoint) -> (CallStatus, String) {
        match next_matching(endpoint, |e| matches!(e, SessionEvent::Ended { .. })).await {
            SessionEvent::Ended { status, reason } => (status, reason),
            other => panic!("unexpected event {other:?}")
        }
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn kill_primary(fx: &Fixture) {
        fx.primary.set_default(ConnectOutcome::Fail(TransportError::Connect {
            endpoint: "mock://primary".into(),
            reason: "refused".into()
        }));
        fx.primary.handle().unwrap().close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_call_binds_best_provider_and_relays_audio() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();

        let status = fx
            .orchestrator
            .start_call(request("call-1"), leg)
            .await
            .unwrap();
        assert_eq!(status.provider.as_str(), "primary");
        assert_eq!(status.provider_session_id.as_deref(), Some("mock-session-1"));

        let stored = fx.store.get_call("call-1").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Answered);
        assert_eq!(stored.metadata[PROVIDER_KEY], "primary");
        assert_eq!(fx.primary.sessions()[0].model, "primary-model");
        assert_eq!(fx.primary.sessions()[0].instructions, "You are a receptionist");

        for seq in 1..=3 {
            endpoint.send_audio(frame(seq)).await.unwrap();
        }
        eventually(|| fx.primary.sent_sequences() == vec![1, 2, 3]).await;

        fx.primary
            .handle()
            .unwrap()
            .push_event(InboundEvent::Audio(frame(42)));
        let reply = endpoint.recv_audio().await.unwrap();
        assert_eq!(reply.sequence(), 42);

        assert_eq!(fx.orchestrator.active_sessions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_completes_call_and_evicts_cache() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-hangup"), leg)
            .await
            .unwrap();
        assert!(fx.cache.contains("call-hangup"));

        endpoint.hangup().await.unwrap();
        let (status, reason) = ended(&mut endpoint).await;
        assert_eq!(status, CallStatus::Completed);
        assert_eq!(reason, "caller hung up");

        let stored = fx.durable.get("call-hangup").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
        assert!(stored.ended_at.is_some());
        assert!(!fx.cache.contains("call-hangup"));
        assert!(fx.orchestrator.status("call-hangup").is_none());
        assert!(fx.primary.handle().unwrap().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_records_reason() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, _endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-end"), leg)
            .await
            .unwrap();

        let summary = fx
            .orchestrator
            .end_call("call-end", "operator request")
            .await
            .unwrap();
        assert_eq!(summary.status, CallStatus::Completed);
        assert_eq!(summary.provider.as_str(), "primary");

        let stored = fx.store.get_call("call-end").await.unwrap().unwrap();
        assert_eq!(stored.metadata[storage::END_REASON_KEY], "operator request");

        assert!(matches!(
            fx.orchestrator.end_call("call-end", "again").await,
            Err(SessionError::NotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_ends_call() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-transfer"), leg)
            .await
            .unwrap();

        endpoint.transfer("+15559999").await.unwrap();
        let (status, reason) = ended(&mut endpoint).await;
        assert_eq!(status, CallStatus::Completed);
        assert_eq!(reason, "transferred to +15559999");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_to_alternate_provider_after_reconnect_exhaustion() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-failover"), leg)
            .await
            .unwrap();

        kill_primary(&fx);

        let switched = next_matching(&mut endpoint, |e| {
            matches!(e, SessionEvent::ProviderSwitched { .. })
        })
        .await;
        assert_eq!(
            switched,
            SessionEvent::ProviderSwitched {
                from: ProviderId::new("primary"),
                to: ProviderId::new("backup")
            }
        );
        // initial connect plus five reconnect attempts
        assert_eq!(fx.primary.connect_count(), 6);

        let backup_session = &fx.backup.sessions()[0];
        assert_eq!(backup_session.provider.as_str(), "backup");
        assert_eq!(backup_session.instructions, "You are a receptionist");

        let status = fx.orchestrator.status("call-failover").unwrap();
        assert_eq!(status.provider.as_str(), "backup");
        assert_eq!(status.failovers, 1);

        let stored = fx.store.get_call("call-failover").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Answered);
        assert_eq!(stored.metadata[PROVIDER_KEY], "backup");
        assert_eq!(stored.metadata[FAILOVERS_KEY], 1);

        endpoint.send_audio(frame(7)).await.unwrap();
        eventually(|| fx.backup.sent_sequences() == vec![7]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_during_failover_ends_call_promptly() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-hangup-failover"), leg)
            .await
            .unwrap();

        fx.backup.set_default(ConnectOutcome::Hang);
        kill_primary(&fx);
        while fx.backup.connect_count() == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let started = tokio::time::Instant::now();
        endpoint.hangup().await.unwrap();
        let (status, reason) = ended(&mut endpoint).await;

        assert_eq!(status, CallStatus::Completed);
        assert_eq!(reason, "caller hung up");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(fx.orchestrator.status("call-hangup-failover").is_none());

        let stored = fx.durable.get("call-hangup-failover").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_alternate_provider_fails_call() {
        let fx = fixture(false, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-alone"), leg)
            .await
            .unwrap();

        kill_primary(&fx);

        let (status, reason) = ended(&mut endpoint).await;
        assert_eq!(status, CallStatus::Failed);
        assert!(reason.contains("provider primary failed"), "{reason}");
        assert!(reason.contains("no alternate provider"), "{reason}");

        let stored = fx.durable.get("call-alone").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Failed);
        assert!(stored.ended_at.is_some());
        assert!(fx.orchestrator.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_disabled_fails_call() {
        let settings = OrchestratorSettings {
            failover_enabled: false,
            ..OrchestratorSettings::default()
        };
        let fx = fixture(true, settings);
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-no-failover"), leg)
            .await
            .unwrap();

        kill_primary(&fx);

        let (status, _) = ended(&mut endpoint).await;
        assert_eq!(status, CallStatus::Failed);
        assert_eq!(fx.backup.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_moves_past_provider_that_fails_to_connect() {
        let fx = fixture(true, OrchestratorSettings::default());
        fx.primary.push_outcome(ConnectOutcome::Fail(TransportError::Connect {
            endpoint: "mock://primary".into(),
            reason: "refused".into()
        }));
        let (leg, _endpoint) = fx.orchestrator.telephony_leg();

        let status = fx
            .orchestrator
            .start_call(request("call-skip"), leg)
            .await
            .unwrap();
        assert_eq!(status.provider.as_str(), "backup");
        assert_eq!(fx.primary.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_skips_provider() {
        let fx = fixture(true, OrchestratorSettings::default());
        fx.orchestrator
            .registry()
            .breaker("primary")
            .unwrap()
            .force_open();
        let (leg, _endpoint) = fx.orchestrator.telephony_leg();

        let status = fx
            .orchestrator
            .start_call(request("call-breaker"), leg)
            .await
            .unwrap();
        assert_eq!(status.provider.as_str(), "backup");
        assert_eq!(fx.primary.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_capable_provider_fails_call_at_start() {
        let fx = fixture(true, OrchestratorSettings::default());
        let mut req = request("call-opus");
        req.requirements = ProviderRequirements::default().with_encoding(AudioEncoding::Opus);
        let (leg, _endpoint) = fx.orchestrator.telephony_leg();

        let err = fx.orchestrator.start_call(req, leg).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Selection(SelectionError::NoCapableProvider { .. })
        ));

        let stored = fx.durable.get("call-opus").await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Failed);
        assert!(fx.orchestrator.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_call_rejected() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, _endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-dup"), leg)
            .await
            .unwrap();

        let (leg, _endpoint2) = fx.orchestrator.telephony_leg();
        assert!(matches!(
            fx.orchestrator.start_call(request("call-dup"), leg).await,
            Err(SessionError::AlreadyActive { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_function_call_round_trip() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg, mut endpoint) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-tools"), leg)
            .await
            .unwrap();

        fx.primary
            .handle()
            .unwrap()
            .push_event(InboundEvent::FunctionCall {
                call_id: "fc-1".into(),
                name: "lookup_order".into(),
                arguments: serde_json::json!({"order": 17})
            });
        let event = next_matching(&mut endpoint, |e| {
            matches!(e, SessionEvent::FunctionCall { .. })
        })
        .await;
        assert!(matches!(
            event,
            SessionEvent::FunctionCall { ref name, .. } if name == "lookup_order"
        ));

        fx.orchestrator
            .submit_function_result("call-tools", "fc-1", serde_json::json!({"status": "shipped"}))
            .await
            .unwrap();
        eventually(|| fx.primary.function_results().len() == 1).await;
        assert_eq!(fx.primary.function_results()[0].0, "fc-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_every_session() {
        let fx = fixture(true, OrchestratorSettings::default());
        let (leg_a, _a) = fx.orchestrator.telephony_leg();
        let (leg_b, _b) = fx.orchestrator.telephony_leg();
        fx.orchestrator
            .start_call(request("call-a"), leg_a)
            .await
            .unwrap();
        fx.orchestrator
            .start_call(request("call-b"), leg_b)
            .await
            .unwrap();

        let mut summaries = fx.orchestrator.shutdown().await;
        summaries.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.reason == "relay shutdown"));
        assert!(fx.store.list_active_calls().await.unwrap().is_empty());
        assert!(fx.orchestrator.active_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_active_calls_repopulates_cache() {
        let fx = fixture(true, OrchestratorSettings::default());
        let before_restart =
            CallStateStore::durable_only(Arc::clone(&fx.durable) as Arc<dyn DurableCallStore>);
        for id in ["call-r1", "call-r2"] {
            before_restart
                .register_call(CallState::new(id, "twilio", CallDirection::Inbound, "+1", "+2"))
                .await
                .unwrap();
        }

        let recovered = fx.orchestrator.recover_active_calls().await.unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(fx.cache.contains("call-r1"));
        assert!(fx.cache.contains("call-r2"));
    }
}

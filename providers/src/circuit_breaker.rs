//! Per-provider circuit breaker.
//!
//! One breaker exists per provider identity and is shared by every call
//! routed to that provider. Transitions and counters are serialized behind
//! a mutex; [`CircuitBreaker::is_accepting`] reads a set of atomics instead
//! so provider selection never contends with call outcomes.

use crate::telemetry::BreakerTelemetry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen
}

impl CircuitState {
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker
    pub success_threshold: u32,
    /// Time spent open before the next call may probe
    pub timeout: Duration,
    pub half_open_max_calls: u32
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 3
        }
    }
}

impl From<&config::BreakerConfig> for CircuitBreakerConfig {
    fn from(config: &config::BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            timeout: Duration::from_secs(config.timeout_seconds),
            half_open_max_calls: config.half_open_max_calls
        }
    }
}

/// A call refused without running the operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker {breaker} rejected the call: retry after {}ms", .retry_after.as_millis())]
pub struct Rejected {
    pub breaker: String,
    /// Time left until the breaker will admit a probe. Zero when the breaker
    /// is half-open and only waiting for in-flight probes to finish.
    pub retry_after: Duration
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit breaker {breaker} is open: retry after {}ms", .retry_after.as_millis())]
    Rejected { breaker: String, retry_after: Duration },

    #[error("{0}")]
    Inner(E)
}

impl<E> BreakerError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Rejected { retry_after, .. } => Some(*retry_after),
            Self::Inner(_) => None
        }
    }
}

impl<E> From<Rejected> for BreakerError<E> {
    fn from(rejected: Rejected) -> Self {
        Self::Rejected {
            breaker: rejected.breaker,
            retry_after: rejected.retry_after
        }
    }
}

/// Point-in-time view of a breaker, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub half_open_in_flight: u32,
    pub forced_open: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_transition_at: Option<DateTime<Utc>>,
    /// Present only while open
    pub retry_after_ms: Option<u64>
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    forced_open: bool,
    /// Bumped on every transition so permits issued in an earlier
    /// half-open period never release a slot of the current one.
    generation: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: Option<DateTime<Utc>>
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    state_hint: AtomicU8,
    forced_hint: AtomicBool,
    opened_at_ms: AtomicU64,
    epoch: Instant,
    telemetry: BreakerTelemetry
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_calls: 0,
                successful_calls: 0,
                failed_calls: 0,
                rejected_calls: 0,
                half_open_in_flight: 0,
                opened_at: None,
                forced_open: false,
                generation: 0,
                last_failure_at: None,
                last_transition_at: None
            }),
            state_hint: AtomicU8::new(CircuitState::Closed.as_u8()),
            forced_hint: AtomicBool::new(false),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            telemetry: BreakerTelemetry
        };
        breaker
            .telemetry
            .record_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state. An open breaker whose timeout has elapsed still reports
    /// `Open` until the next call attempt moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Whether a call attempt right now could be admitted.
    ///
    /// Lock-free and eventually consistent: an open breaker past its timeout
    /// counts as accepting since the next attempt will probe it, and a
    /// half-open breaker counts as accepting even if its probe slots are
    /// momentarily full.
    pub fn is_accepting(&self) -> bool {
        match CircuitState::from_u8(self.state_hint.load(Ordering::Acquire)) {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.forced_hint.load(Ordering::Acquire) {
                    return false;
                }
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                let timeout_ms = self.config.timeout.as_millis() as u64;
                self.millis_since_epoch() >= opened_at.saturating_add(timeout_ms)
            }
        }
    }

    /// Remaining open time, or `None` when the breaker is not open.
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        self.open_remaining(&inner, Instant::now())
    }

    /// Ask to run one call.
    ///
    /// The returned permit must be settled with [`BreakerPermit::success`] or
    /// [`BreakerPermit::failure`]. Dropping it unsettled frees any half-open
    /// slot it holds without recording an outcome.
    pub fn acquire(&self) -> Result<BreakerPermit<'_>, Rejected> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.total_calls += 1;

        if inner.state == CircuitState::Open {
            match self.open_remaining(&inner, now) {
                Some(remaining) if !remaining.is_zero() || inner.forced_open => {
                    return Err(self.reject(&mut inner, remaining));
                }
                _ => self.transition(&mut inner, CircuitState::HalfOpen)
            }
        }

        match inner.state {
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    return Err(self.reject(&mut inner, Duration::ZERO));
                }
                inner.half_open_in_flight += 1;
                Ok(BreakerPermit {
                    breaker: self,
                    generation: inner.generation,
                    probe: true,
                    settled: false
                })
            }
            _ => Ok(BreakerPermit {
                breaker: self,
                generation: inner.generation,
                probe: false,
                settled: false
            })
        }
    }

    /// Run `operation` under the breaker, recording its outcome.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>
    {
        let permit = self.acquire()?;
        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Record a success for a call made outside [`acquire`](Self::acquire).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        self.on_success(&mut inner);
    }

    /// Record a failure for a call made outside [`acquire`](Self::acquire).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        self.on_failure(&mut inner);
    }

    /// Force the breaker closed and clear the failure and success streaks.
    /// Lifetime totals are kept. Resetting a closed breaker records no
    /// transition.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        self.forced_hint.store(false, Ordering::Release);
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
            inner.consecutive_successes = 0;
            return;
        }
        self.transition(&mut inner, CircuitState::Closed);
        info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Administrative lockout: the breaker stays open until [`reset`](Self::reset).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        self.forced_hint.store(true, Ordering::Release);
        if inner.state == CircuitState::Open {
            self.mark_opened(&mut inner, Instant::now());
        } else {
            self.transition(&mut inner, CircuitState::Open);
        }
        warn!(breaker = %self.name, "Circuit breaker forced open");
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            successful_calls: inner.successful_calls,
            failed_calls: inner.failed_calls,
            rejected_calls: inner.rejected_calls,
            half_open_in_flight: inner.half_open_in_flight,
            forced_open: inner.forced_open,
            last_failure_at: inner.last_failure_at,
            last_transition_at: inner.last_transition_at,
            retry_after_ms: self
                .open_remaining(&inner, Instant::now())
                .map(|d| d.as_millis() as u64)
        }
    }

    fn settle(&self, generation: u64, probe: bool, success: bool) {
        let mut inner = self.inner.lock();
        if probe && generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if success {
            self.on_success(&mut inner);
        } else {
            self.on_failure(&mut inner);
        }
    }

    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if generation == inner.generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn on_success(&self, inner: &mut Inner) {
        inner.successful_calls += 1;
        inner.consecutive_failures = 0;
        self.telemetry.record_call(&self.name, "success");

        if inner.state == CircuitState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                self.transition(inner, CircuitState::Closed);
            }
        }
    }

    fn on_failure(&self, inner: &mut Inner) {
        inner.failed_calls += 1;
        inner.consecutive_failures += 1;
        inner.consecutive_successes = 0;
        inner.last_failure_at = Some(Utc::now());
        self.telemetry.record_call(&self.name, "failure");

        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                self.transition(inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(inner, CircuitState::Open),
            _ => {}
        }
    }

    fn reject(&self, inner: &mut Inner, retry_after: Duration) -> Rejected {
        inner.rejected_calls += 1;
        self.telemetry.record_call(&self.name, "rejected");
        Rejected {
            breaker: self.name.clone(),
            retry_after
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.generation += 1;
        inner.half_open_in_flight = 0;
        inner.consecutive_successes = 0;
        inner.last_transition_at = Some(Utc::now());

        match to {
            CircuitState::Open => self.mark_opened(inner, Instant::now()),
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::HalfOpen => {}
        }
        self.state_hint.store(to.as_u8(), Ordering::Release);
        self.telemetry.record_transition(&self.name, from, to);

        if to == CircuitState::Open {
            error!(
                breaker = %self.name,
                from = %from,
                consecutive_failures = inner.consecutive_failures,
                "Circuit breaker OPENED"
            );
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker transition");
        }
    }

    fn mark_opened(&self, inner: &mut Inner, now: Instant) {
        inner.opened_at = Some(now);
        let since_epoch = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.opened_at_ms.store(since_epoch, Ordering::Release);
    }

    fn open_remaining(&self, inner: &Inner, now: Instant) -> Option<Duration> {
        if inner.state != CircuitState::Open {
            return None;
        }
        if inner.forced_open {
            return Some(self.config.timeout);
        }
        let opened_at = inner.opened_at?;
        Some(
            self.config
                .timeout
                .saturating_sub(now.saturating_duration_since(opened_at))
        )
    }

    fn millis_since_epoch(&self) -> u64 {
        Instant::now()
            .saturating_duration_since(self.epoch)
            .as_millis() as u64
    }
}

/// Admission for one call. Holds a half-open probe slot when issued while
/// half-open.
#[must_use = "settle the permit with success() or failure()"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool
}

impl BreakerPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(self.generation, self.probe, false);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release(self.generation);
        }
    }
}

//! Reconnect policies.
//!
//! The reconnect loop itself is shared by every provider. Provider quirks
//! plug in here: an extra wait after a rate-limit signal and tolerance for
//! session identifiers that change across a reconnect.

use crate::transport::DisconnectCause;
use relay_core::ProviderId;
use std::time::Duration;
use tracing::info;

/// Tunables of one provider connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub handshake_timeout: Duration,
    pub stale_after: Duration,
    pub health_check_interval: Duration,
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            stale_after: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(5),
            command_queue_capacity: 512,
            event_queue_capacity: 256
        }
    }
}

impl ConnectionSettings {
    pub fn from_config(reconnect: &config::ReconnectConfig, event_queue_capacity: usize) -> Self {
        Self {
            max_attempts: reconnect.max_attempts,
            initial_backoff: reconnect.initial_backoff(),
            max_backoff: reconnect.max_backoff(),
            handshake_timeout: reconnect.handshake_timeout(),
            stale_after: reconnect.stale_after(),
            health_check_interval: reconnect.health_check_interval(),
            command_queue_capacity: reconnect.command_queue_capacity.max(1),
            event_queue_capacity: event_queue_capacity.max(1)
        }
    }
}

/// `initial * 2^(attempt-1)`, capped at `max`. Attempts are 1-based.
pub fn exponential_backoff(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    initial
        .checked_mul(1u32 << exponent)
        .map_or(max, |backoff| backoff.min(max))
}

pub trait ReconnectPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Extra wait before the first reconnect attempt.
    fn pre_reconnect_delay(&self, _cause: &DisconnectCause) -> Option<Duration> {
        None
    }

    fn backoff(&self, attempt: u32, settings: &ConnectionSettings) -> Duration {
        exponential_backoff(settings.initial_backoff, settings.max_backoff, attempt)
    }

    /// Called once a reconnect succeeded, with the provider session
    /// identifiers before and after.
    fn after_reconnect(
        &self,
        provider: &ProviderId,
        previous: Option<&str>,
        current: Option<&str>,
    ) {
        if previous != current {
            info!(
                provider = %provider,
                previous = previous.unwrap_or("-"),
                current = current.unwrap_or("-"),
                "Provider assigned a new session id on reconnect"
            );
        }
    }
}

/// Plain exponential backoff.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardPolicy;

impl ReconnectPolicy for StandardPolicy {
    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Waits out a rate-limit signal before the normal backoff loop.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitAwarePolicy {
    max_wait: Duration
}

impl RateLimitAwarePolicy {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }
}

impl Default for RateLimitAwarePolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ReconnectPolicy for RateLimitAwarePolicy {
    fn name(&self) -> &'static str {
        "rate_limit_aware"
    }

    fn pre_reconnect_delay(&self, cause: &DisconnectCause) -> Option<Duration> {
        match cause {
            DisconnectCause::RateLimited { retry_after } => {
                Some(retry_after.unwrap_or(self.max_wait).min(self.max_wait))
            }
            DisconnectCause::Transport(e) if e.is_rate_limit() => Some(self.max_wait),
            _ => None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::TransportError;

    #[test]
    fn test_backoff_schedule_doubles() {
        let settings = ConnectionSettings::default();
        let schedule: Vec<u64> = (1..=5)
            .map(|attempt| StandardPolicy.backoff(attempt, &settings).as_secs())
            .collect();
        assert_eq!(schedule, vec![1, 2, 4, 8, 16]);
        assert_eq!(schedule.iter().sum::<u64>(), 31);
    }

    #[test]
    fn test_backoff_is_capped() {
        let settings = ConnectionSettings::default();
        assert_eq!(
            StandardPolicy.backoff(7, &settings),
            Duration::from_secs(30)
        );
        assert_eq!(
            StandardPolicy.backoff(u32::MAX, &settings),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_standard_policy_never_waits_extra() {
        let cause = DisconnectCause::RateLimited {
            retry_after: Some(Duration::from_secs(5))
        };
        assert_eq!(StandardPolicy.pre_reconnect_delay(&cause), None);
    }

    #[test]
    fn test_rate_limit_policy_honours_hint_up_to_cap() {
        let policy = RateLimitAwarePolicy::new(Duration::from_secs(60));

        let short = DisconnectCause::RateLimited {
            retry_after: Some(Duration::from_secs(10))
        };
        assert_eq!(policy.pre_reconnect_delay(&short), Some(Duration::from_secs(10)));

        let long = DisconnectCause::RateLimited {
            retry_after: Some(Duration::from_secs(600))
        };
        assert_eq!(policy.pre_reconnect_delay(&long), Some(Duration::from_secs(60)));

        let unspecified = DisconnectCause::Transport(TransportError::RateLimited {
            retry_after_secs: None
        });
        assert_eq!(
            policy.pre_reconnect_delay(&unspecified),
            Some(Duration::from_secs(60))
        );

        assert_eq!(policy.pre_reconnect_delay(&DisconnectCause::Closed), None);
    }

    #[test]
    fn test_settings_from_config() {
        let reconnect = config::ReconnectConfig {
            max_attempts: 3,
            initial_backoff_ms: 250,
            ..config::ReconnectConfig::default()
        };
        let settings = ConnectionSettings::from_config(&reconnect, 64);
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.initial_backoff, Duration::from_millis(250));
        assert_eq!(settings.event_queue_capacity, 64);
    }
}

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge};
use relay_core::{ConnectionState, ProviderId};

#[derive(Debug, Default, Clone, Copy)]
pub struct BreakerTelemetry;

impl BreakerTelemetry {
    pub fn record_state(&self, breaker: &str, state: CircuitState) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_string()).set(state.gauge_value());
    }

    pub fn record_call(&self, breaker: &str, outcome: &'static str) {
        let labels = [("breaker", breaker.to_string()), ("outcome", outcome.to_string())];
        counter!("circuit_breaker_calls_total", &labels).increment(1);
    }

    pub fn record_transition(&self, breaker: &str, from: CircuitState, to: CircuitState) {
        let labels = [
            ("breaker", breaker.to_string()),
            ("from", from.to_string()),
            ("to", to.to_string())
        ];
        counter!("circuit_breaker_transitions_total", &labels).increment(1);
        self.record_state(breaker, to);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionTelemetry;

impl ConnectionTelemetry {
    pub fn record_state(&self, provider: &ProviderId, state: ConnectionState) {
        gauge!("provider_connection_state", "provider" => provider.to_string())
            .set(state.gauge_value());
    }

    pub fn record_frames(&self, provider: &ProviderId, direction: &'static str, count: u64) {
        if count == 0 {
            return;
        }
        let labels = [
            ("provider", provider.to_string()),
            ("direction", direction.to_string())
        ];
        counter!("provider_connection_frames_total", &labels).increment(count);
    }

    pub fn record_reconnect(&self, provider: &ProviderId, outcome: &'static str) {
        let labels = [
            ("provider", provider.to_string()),
            ("outcome", outcome.to_string())
        ];
        counter!("provider_connection_reconnects_total", &labels).increment(1);
    }
}

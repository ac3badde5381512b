use crate::ObservabilityError;
use config::ObservabilityConfig;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Serve Prometheus metrics on the configured port. Returns `false` when
/// metrics are disabled. Must run inside a Tokio runtime.
pub fn install_metrics_exporter(config: &ObservabilityConfig) -> Result<bool, ObservabilityError> {
    if !config.metrics_enabled {
        info!("Metrics exporter disabled");
        return Ok(false);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ObservabilityError::Exporter {
            port: config.metrics_port,
            reason: e.to_string()
        })?;

    describe_metrics();
    info!(%addr, "Metrics exporter listening");
    Ok(true)
}

pub fn describe_metrics() {
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state: 0 closed, 1 open, 2 half-open"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Calls through a circuit breaker by outcome"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_gauge!("provider_connection_state", "Provider connection state");
    describe_counter!(
        "provider_connection_reconnects_total",
        "Provider reconnect attempts and their outcomes"
    );
    describe_counter!(
        "provider_connection_frames_total",
        "Audio frames by direction: sent, received, buffered, replayed, dropped"
    );
    describe_counter!(
        "call_store_operations_total",
        "Call store operations by tier and status"
    );
    describe_counter!(
        "call_store_cache_degraded_total",
        "Call store operations that fell back to the durable tier"
    );
    describe_gauge!("sessions_active", "Live relay sessions");
    describe_counter!("sessions_total", "Finished sessions by outcome");
    describe_counter!(
        "session_failovers_total",
        "Mid-call switches from one provider to another"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;

    #[test]
    fn test_disabled_exporter_is_not_installed() {
        let config = ObservabilityConfig {
            metrics_enabled: false,
            ..ObservabilityConfig::default()
        };
        assert!(!install_metrics_exporter(&config).unwrap());
    }

    #[test]
    fn test_descriptions_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            describe_metrics();
            metrics::counter!("sessions_total", "outcome" => "completed").increment(1);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (_, unit, description, _) = snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == "sessions_total")
            .expect("sessions_total recorded");
        assert!(unit.is_none());
        assert_eq!(description.as_deref(), Some("Finished sessions by outcome"));
    }
}

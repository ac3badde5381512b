use metrics::{counter, gauge};
use relay_core::ProviderId;

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionTelemetry;

impl SessionTelemetry {
    pub fn set_active(&self, count: usize) {
        gauge!("sessions_active").set(count as f64);
    }

    pub fn record_outcome(&self, outcome: &'static str) {
        counter!("sessions_total", "outcome" => outcome).increment(1);
    }

    pub fn record_failover(&self, from: &ProviderId, to: &ProviderId) {
        let labels = [("from", from.to_string()), ("to", to.to_string())];
        counter!("session_failovers_total", &labels).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_failover_counter_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            let telemetry = SessionTelemetry;
            telemetry.record_failover(&ProviderId::new("primary"), &ProviderId::new("backup"));
            telemetry.record_failover(&ProviderId::new("primary"), &ProviderId::new("backup"));
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let (key, _, _, value) = snapshot
            .iter()
            .find(|(key, ..)| key.key().name() == "session_failovers_total")
            .expect("failover counter recorded");
        let labels: Vec<(String, String)> = key
            .key()
            .labels()
            .map(|label| (label.key().to_string(), label.value().to_string()))
            .collect();
        assert!(labels.contains(&("from".to_string(), "primary".to_string())));
        assert!(labels.contains(&("to".to_string(), "backup".to_string())));
        assert_eq!(value, &DebugValue::Counter(2));
    }
}

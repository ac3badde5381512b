use metrics::{counter, histogram};

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreTelemetry;

impl StoreTelemetry {
    pub fn record_operation(&self, operation: &str, tier: &str, success: bool, duration_ms: f64) {
        let status = if success { "success" } else { "failure" };
        let labels = [
            ("operation", operation.to_string()),
            ("tier", tier.to_string()),
            ("status", status.to_string())
        ];
        counter!("call_store_operations_total", &labels).increment(1);

        let histogram_labels = [("operation", operation.to_string()), ("tier", tier.to_string())];
        histogram!("call_store_operation_duration_seconds", &histogram_labels)
            .record(duration_ms / 1000.0);
    }

    pub fn record_cache_degraded(&self, operation: &str) {
        counter!("call_store_cache_degraded_total", "operation" => operation.to_string())
            .increment(1);
    }

    pub fn record_recovered(&self, count: usize) {
        counter!("call_store_recovered_calls_total").increment(count as u64);
    }
}

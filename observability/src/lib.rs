//! # Observability
//!
//! Process-wide logging and metrics setup for the relay binary:
//! - [`init_tracing`]: `tracing-subscriber` with an `EnvFilter`, plain or JSON
//! - [`install_metrics_exporter`]: Prometheus scrape endpoint for the
//!   `metrics` facade
//! - [`describe_metrics`]: help text for every metric the relay emits

pub mod logging;
pub mod exporter;

pub use logging::{build_filter, init_tracing};
pub use exporter::{describe_metrics, install_metrics_exporter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Failed to install tracing subscriber: {reason}")]
    Subscriber { reason: String },

    #[error("Failed to install metrics exporter on port {port}: {reason}")]
    Exporter { port: u16, reason: String }
}

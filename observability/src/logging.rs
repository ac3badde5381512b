use crate::ObservabilityError;
use config::ObservabilityConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// The effective filter: `rust_log` when set, the configured level otherwise.
pub fn build_filter(
    config: &ObservabilityConfig,
    rust_log: Option<&str>
) -> Result<EnvFilter, ObservabilityError> {
    let directives = rust_log
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(&config.logging_level);

    EnvFilter::try_new(directives).map_err(|e| ObservabilityError::InvalidFilter {
        filter: directives.to_string(),
        reason: e.to_string()
    })
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filter = build_filter(config, rust_log.as_deref())?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_logs {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    installed.map_err(|e| ObservabilityError::Subscriber {
        reason: e.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_used_without_rust_log() {
        let config = ObservabilityConfig {
            logging_level: "debug".to_string(),
            ..ObservabilityConfig::default()
        };
        let filter = build_filter(&config, None).unwrap();
        assert_eq!(filter.to_string(), "debug");

        let blank = build_filter(&config, Some("  ")).unwrap();
        assert_eq!(blank.to_string(), "debug");
    }

    #[test]
    fn test_rust_log_overrides_config() {
        let config = ObservabilityConfig::default();
        let filter = build_filter(&config, Some("providers=trace,warn")).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("providers=trace"), "{rendered}");
        assert!(rendered.contains("warn"), "{rendered}");
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = ObservabilityConfig::default();
        let err = build_filter(&config, Some("providers=verbose")).unwrap_err();
        assert!(matches!(err, ObservabilityError::InvalidFilter { .. }));
    }
}

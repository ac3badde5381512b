//! # Configuration Precedence
//!
//! Merges configuration from multiple sources with precedence rules.
//!
//! # Precedence Order
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values (lowest priority)
//!
//! A layer only overrides a field whose value differs from the built-in
//! default, so a layer that leaves a field unset cannot clobber a lower one.

use crate::config::{
    BreakerConfig, Config, ObservabilityConfig, PostgresConfig, ReconnectConfig, RedisConfig,
    ServerConfig, SessionConfig
};
use std::fmt::Display;

/// Merge multiple configuration sources with precedence.
///
/// # M-CANONICAL-DOCS
///
/// ## Usage
/// ```rust,no_run
/// use config::{Config, merge_configs, load_from_file, load_from_env};
/// use std::path::Path;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let from_file = load_from_file(Path::new("relay.toml"))?;
///     let from_env = load_from_env()?;
///
///     let _config = merge_configs(
///         Config::default(),
///         from_file,
///         "file",
///         from_env,
///         "env",
///         None,
///         "cli"
///     );
///     Ok(())
/// }
/// ```
///
/// ## Registry
/// The provider list is replaced wholesale by the highest layer that
/// declares any providers; lists are never concatenated.
pub fn merge_configs(
    defaults: Config,
    file_config: Config,
    file_source_name: &str,
    env_config: Config,
    env_source_name: &str,
    cli_config: Option<Config>,
    cli_source_name: &str
) -> Config {
    let mut config = defaults;

    config = merge_with_logging(config, file_config, file_source_name);
    config = merge_with_logging(config, env_config, env_source_name);

    if let Some(cli) = cli_config {
        config = merge_with_logging(config, cli, cli_source_name);
    }

    config
}

fn merge_with_logging(mut base: Config, layer: Config, source_name: &str) -> Config {
    let mut changes = Vec::new();

    merge_postgres(&mut base.storage.postgres, &layer.storage.postgres, &mut changes);
    merge_redis(&mut base.storage.redis, &layer.storage.redis, &mut changes);
    merge_breaker(&mut base.breaker, &layer.breaker, &mut changes);
    merge_reconnect(&mut base.reconnect, &layer.reconnect, &mut changes);
    merge_session(&mut base.session, &layer.session, &mut changes);
    merge_observability(&mut base.observability, &layer.observability, &mut changes);
    merge_server(&mut base.server, &layer.server, &mut changes);

    if !layer.registry.providers.is_empty() && layer.registry != base.registry {
        changes.push(format!(
            "registry.providers = [{} providers]",
            layer.registry.providers.len()
        ));
        base.registry = layer.registry;
    }

    if !changes.is_empty() {
        tracing::info!("Configuration from {}: {:?}", source_name, changes);
    }

    base
}

/// Take `layer` when it differs from both the default and the current value.
fn merge_field<T>(base: &mut T, layer: &T, default: &T, path: &str, changes: &mut Vec<String>)
where
    T: PartialEq + Clone + Display
{
    if layer != default && layer != base {
        changes.push(format!("{path} = {layer}"));
        base.clone_from(layer);
    }
}

fn merge_postgres(base: &mut PostgresConfig, layer: &PostgresConfig, changes: &mut Vec<String>) {
    let d = PostgresConfig::default();
    merge_field(&mut base.host, &layer.host, &d.host, "storage.postgres.host", changes);
    merge_field(&mut base.port, &layer.port, &d.port, "storage.postgres.port", changes);
    merge_field(
        &mut base.database,
        &layer.database,
        &d.database,
        "storage.postgres.database",
        changes
    );
    merge_field(
        &mut base.username,
        &layer.username,
        &d.username,
        "storage.postgres.username",
        changes
    );
    if !layer.password.is_empty() && layer.password != base.password {
        changes.push("storage.postgres.password = ***".to_string());
        base.password.clone_from(&layer.password);
    }
    merge_field(
        &mut base.pool_size,
        &layer.pool_size,
        &d.pool_size,
        "storage.postgres.pool_size",
        changes
    );
    merge_field(
        &mut base.timeout_seconds,
        &layer.timeout_seconds,
        &d.timeout_seconds,
        "storage.postgres.timeout_seconds",
        changes
    );
}

fn merge_redis(base: &mut RedisConfig, layer: &RedisConfig, changes: &mut Vec<String>) {
    let d = RedisConfig::default();
    merge_field(&mut base.enabled, &layer.enabled, &d.enabled, "storage.redis.enabled", changes);
    merge_field(&mut base.host, &layer.host, &d.host, "storage.redis.host", changes);
    merge_field(&mut base.port, &layer.port, &d.port, "storage.redis.port", changes);
    merge_field(&mut base.db, &layer.db, &d.db, "storage.redis.db", changes);
    merge_field(
        &mut base.key_prefix,
        &layer.key_prefix,
        &d.key_prefix,
        "storage.redis.key_prefix",
        changes
    );
    merge_field(
        &mut base.entry_ttl_seconds,
        &layer.entry_ttl_seconds,
        &d.entry_ttl_seconds,
        "storage.redis.entry_ttl_seconds",
        changes
    );
    merge_field(
        &mut base.timeout_seconds,
        &layer.timeout_seconds,
        &d.timeout_seconds,
        "storage.redis.timeout_seconds",
        changes
    );
}

fn merge_breaker(base: &mut BreakerConfig, layer: &BreakerConfig, changes: &mut Vec<String>) {
    let d = BreakerConfig::default();
    merge_field(
        &mut base.failure_threshold,
        &layer.failure_threshold,
        &d.failure_threshold,
        "breaker.failure_threshold",
        changes
    );
    merge_field(
        &mut base.success_threshold,
        &layer.success_threshold,
        &d.success_threshold,
        "breaker.success_threshold",
        changes
    );
    merge_field(
        &mut base.timeout_seconds,
        &layer.timeout_seconds,
        &d.timeout_seconds,
        "breaker.timeout_seconds",
        changes
    );
    merge_field(
        &mut base.half_open_max_calls,
        &layer.half_open_max_calls,
        &d.half_open_max_calls,
        "breaker.half_open_max_calls",
        changes
    );
}

fn merge_reconnect(base: &mut ReconnectConfig, layer: &ReconnectConfig, changes: &mut Vec<String>) {
    let d = ReconnectConfig::default();
    merge_field(
        &mut base.max_attempts,
        &layer.max_attempts,
        &d.max_attempts,
        "reconnect.max_attempts",
        changes
    );
    merge_field(
        &mut base.initial_backoff_ms,
        &layer.initial_backoff_ms,
        &d.initial_backoff_ms,
        "reconnect.initial_backoff_ms",
        changes
    );
    merge_field(
        &mut base.max_backoff_ms,
        &layer.max_backoff_ms,
        &d.max_backoff_ms,
        "reconnect.max_backoff_ms",
        changes
    );
    merge_field(
        &mut base.handshake_timeout_seconds,
        &layer.handshake_timeout_seconds,
        &d.handshake_timeout_seconds,
        "reconnect.handshake_timeout_seconds",
        changes
    );
    merge_field(
        &mut base.stale_after_seconds,
        &layer.stale_after_seconds,
        &d.stale_after_seconds,
        "reconnect.stale_after_seconds",
        changes
    );
    merge_field(
        &mut base.health_check_interval_seconds,
        &layer.health_check_interval_seconds,
        &d.health_check_interval_seconds,
        "reconnect.health_check_interval_seconds",
        changes
    );
    merge_field(
        &mut base.replay_buffer_capacity,
        &layer.replay_buffer_capacity,
        &d.replay_buffer_capacity,
        "reconnect.replay_buffer_capacity",
        changes
    );
    merge_field(
        &mut base.rate_limit_wait_seconds,
        &layer.rate_limit_wait_seconds,
        &d.rate_limit_wait_seconds,
        "reconnect.rate_limit_wait_seconds",
        changes
    );
    merge_field(
        &mut base.command_queue_capacity,
        &layer.command_queue_capacity,
        &d.command_queue_capacity,
        "reconnect.command_queue_capacity",
        changes
    );
}

fn merge_session(base: &mut SessionConfig, layer: &SessionConfig, changes: &mut Vec<String>) {
    let d = SessionConfig::default();
    merge_field(
        &mut base.event_queue_capacity,
        &layer.event_queue_capacity,
        &d.event_queue_capacity,
        "session.event_queue_capacity",
        changes
    );
    merge_field(
        &mut base.audio_queue_capacity,
        &layer.audio_queue_capacity,
        &d.audio_queue_capacity,
        "session.audio_queue_capacity",
        changes
    );
    merge_field(
        &mut base.failover_enabled,
        &layer.failover_enabled,
        &d.failover_enabled,
        "session.failover_enabled",
        changes
    );
    merge_field(
        &mut base.max_failovers,
        &layer.max_failovers,
        &d.max_failovers,
        "session.max_failovers",
        changes
    );
}

fn merge_observability(
    base: &mut ObservabilityConfig,
    layer: &ObservabilityConfig,
    changes: &mut Vec<String>
) {
    let d = ObservabilityConfig::default();
    merge_field(
        &mut base.metrics_enabled,
        &layer.metrics_enabled,
        &d.metrics_enabled,
        "observability.metrics_enabled",
        changes
    );
    merge_field(
        &mut base.metrics_port,
        &layer.metrics_port,
        &d.metrics_port,
        "observability.metrics_port",
        changes
    );
    merge_field(
        &mut base.logging_level,
        &layer.logging_level,
        &d.logging_level,
        "observability.logging_level",
        changes
    );
    merge_field(
        &mut base.json_logs,
        &layer.json_logs,
        &d.json_logs,
        "observability.json_logs",
        changes
    );
}

fn merge_server(base: &mut ServerConfig, layer: &ServerConfig, changes: &mut Vec<String>) {
    let d = ServerConfig::default();
    merge_field(
        &mut base.admin_host,
        &layer.admin_host,
        &d.admin_host,
        "server.admin_host",
        changes
    );
    merge_field(
        &mut base.admin_port,
        &layer.admin_port,
        &d.admin_port,
        "server.admin_port",
        changes
    );
}

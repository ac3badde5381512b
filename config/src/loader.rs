//! # Environment Variable Loader
//!
//! Loads configuration from environment variables following 12-factor app
//! principles.
//!
//! # Naming Convention
//! - `VR_*`: Relay settings (breaker, reconnect, session, observability,
//!   server)
//! - `PG_*`: PostgreSQL settings
//! - `RD_*`: Redis settings
//!
//! The provider registry is only read from configuration files.

use crate::config::{
    BreakerConfig, Config, ObservabilityConfig, PostgresConfig, ReconnectConfig, RedisConfig,
    RegistryConfig, ServerConfig, SessionConfig, StorageConfig
};
use std::env;

/// A variable is set but cannot be parsed into the expected type.
#[derive(Debug, thiserror::Error)]
#[error("Invalid value '{value}' for {key}: {reason}")]
pub struct EnvError {
    pub key: String,
    pub value: String,
    pub reason: String
}

/// Load configuration from environment variables.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Unset variables fall back to defaults. A set variable that fails to parse
/// is an error rather than silently ignored.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_env;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_env()?;
///     println!("PostgreSQL host: {}", config.storage.postgres.host);
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables
/// ### PostgreSQL Settings (`PG_*`)
/// - `PG_HOST`, `PG_PORT`, `PG_DATABASE`, `PG_USERNAME`, `PG_PASSWORD`
/// - `PG_POOL_SIZE`, `PG_TIMEOUT_SECONDS`
///
/// ### Redis Settings (`RD_*`)
/// - `RD_ENABLED`, `RD_HOST`, `RD_PORT`, `RD_DB`
/// - `RD_KEY_PREFIX`, `RD_ENTRY_TTL_SECONDS`, `RD_TIMEOUT_SECONDS`
///
/// ### Breaker Settings
/// - `VR_BREAKER_FAILURE_THRESHOLD`, `VR_BREAKER_SUCCESS_THRESHOLD`
/// - `VR_BREAKER_TIMEOUT_SECONDS`, `VR_BREAKER_HALF_OPEN_MAX_CALLS`
///
/// ### Reconnect Settings
/// - `VR_RECONNECT_MAX_ATTEMPTS`, `VR_RECONNECT_INITIAL_BACKOFF_MS`
/// - `VR_RECONNECT_MAX_BACKOFF_MS`, `VR_HANDSHAKE_TIMEOUT_SECONDS`
/// - `VR_STALE_AFTER_SECONDS`, `VR_HEALTH_CHECK_INTERVAL_SECONDS`
/// - `VR_REPLAY_BUFFER_CAPACITY`, `VR_RATE_LIMIT_WAIT_SECONDS`
///
/// ### Session Settings
/// - `VR_EVENT_QUEUE_CAPACITY`, `VR_AUDIO_QUEUE_CAPACITY`
/// - `VR_FAILOVER_ENABLED`, `VR_MAX_FAILOVERS`
///
/// ### Observability and Server
/// - `VR_LOG_LEVEL`, `VR_JSON_LOGS`, `VR_METRICS_ENABLED`, `VR_METRICS_PORT`
/// - `VR_ADMIN_HOST`, `VR_ADMIN_PORT`
pub fn load_from_env() -> Result<Config, EnvError> {
    Ok(Config {
        storage: StorageConfig {
            postgres: load_postgres_from_env()?,
            redis: load_redis_from_env()?
        },
        breaker: load_breaker_from_env()?,
        reconnect: load_reconnect_from_env()?,
        registry: RegistryConfig::default(),
        session: load_session_from_env()?,
        observability: load_observability_from_env()?,
        server: load_server_from_env()?
    })
}

fn load_postgres_from_env() -> Result<PostgresConfig, EnvError> {
    let d = PostgresConfig::default();
    Ok(PostgresConfig {
        host: env::var("PG_HOST").unwrap_or(d.host),
        port: parse_env_or("PG_PORT", d.port)?,
        database: env::var("PG_DATABASE").unwrap_or(d.database),
        username: env::var("PG_USERNAME").unwrap_or(d.username),
        password: env::var("PG_PASSWORD").unwrap_or_default(),
        pool_size: parse_env_or("PG_POOL_SIZE", d.pool_size)?,
        timeout_seconds: parse_env_or("PG_TIMEOUT_SECONDS", d.timeout_seconds)?
    })
}

fn load_redis_from_env() -> Result<RedisConfig, EnvError> {
    let d = RedisConfig::default();
    Ok(RedisConfig {
        enabled: parse_env_or("RD_ENABLED", d.enabled)?,
        host: env::var("RD_HOST").unwrap_or(d.host),
        port: parse_env_or("RD_PORT", d.port)?,
        db: parse_env_or("RD_DB", d.db)?,
        key_prefix: env::var("RD_KEY_PREFIX").unwrap_or(d.key_prefix),
        entry_ttl_seconds: parse_env_or("RD_ENTRY_TTL_SECONDS", d.entry_ttl_seconds)?,
        timeout_seconds: parse_env_or("RD_TIMEOUT_SECONDS", d.timeout_seconds)?
    })
}

fn load_breaker_from_env() -> Result<BreakerConfig, EnvError> {
    let d = BreakerConfig::default();
    Ok(BreakerConfig {
        failure_threshold: parse_env_or("VR_BREAKER_FAILURE_THRESHOLD", d.failure_threshold)?,
        success_threshold: parse_env_or("VR_BREAKER_SUCCESS_THRESHOLD", d.success_threshold)?,
        timeout_seconds: parse_env_or("VR_BREAKER_TIMEOUT_SECONDS", d.timeout_seconds)?,
        half_open_max_calls: parse_env_or(
            "VR_BREAKER_HALF_OPEN_MAX_CALLS",
            d.half_open_max_calls
        )?
    })
}

fn load_reconnect_from_env() -> Result<ReconnectConfig, EnvError> {
    let d = ReconnectConfig::default();
    Ok(ReconnectConfig {
        max_attempts: parse_env_or("VR_RECONNECT_MAX_ATTEMPTS", d.max_attempts)?,
        initial_backoff_ms: parse_env_or("VR_RECONNECT_INITIAL_BACKOFF_MS", d.initial_backoff_ms)?,
        max_backoff_ms: parse_env_or("VR_RECONNECT_MAX_BACKOFF_MS", d.max_backoff_ms)?,
        handshake_timeout_seconds: parse_env_or(
            "VR_HANDSHAKE_TIMEOUT_SECONDS",
            d.handshake_timeout_seconds
        )?,
        stale_after_seconds: parse_env_or("VR_STALE_AFTER_SECONDS", d.stale_after_seconds)?,
        health_check_interval_seconds: parse_env_or(
            "VR_HEALTH_CHECK_INTERVAL_SECONDS",
            d.health_check_interval_seconds
        )?,
        replay_buffer_capacity: parse_env_or(
            "VR_REPLAY_BUFFER_CAPACITY",
            d.replay_buffer_capacity
        )?,
        rate_limit_wait_seconds: parse_env_or(
            "VR_RATE_LIMIT_WAIT_SECONDS",
            d.rate_limit_wait_seconds
        )?,
        command_queue_capacity: parse_env_or(
            "VR_COMMAND_QUEUE_CAPACITY",
            d.command_queue_capacity
        )?
    })
}

fn load_session_from_env() -> Result<SessionConfig, EnvError> {
    let d = SessionConfig::default();
    Ok(SessionConfig {
        event_queue_capacity: parse_env_or("VR_EVENT_QUEUE_CAPACITY", d.event_queue_capacity)?,
        audio_queue_capacity: parse_env_or("VR_AUDIO_QUEUE_CAPACITY", d.audio_queue_capacity)?,
        failover_enabled: parse_env_or("VR_FAILOVER_ENABLED", d.failover_enabled)?,
        max_failovers: parse_env_or("VR_MAX_FAILOVERS", d.max_failovers)?
    })
}

fn load_observability_from_env() -> Result<ObservabilityConfig, EnvError> {
    let d = ObservabilityConfig::default();
    Ok(ObservabilityConfig {
        metrics_enabled: parse_env_or("VR_METRICS_ENABLED", d.metrics_enabled)?,
        metrics_port: parse_env_or("VR_METRICS_PORT", d.metrics_port)?,
        logging_level: env::var("VR_LOG_LEVEL").unwrap_or(d.logging_level),
        json_logs: parse_env_or("VR_JSON_LOGS", d.json_logs)?
    })
}

fn load_server_from_env() -> Result<ServerConfig, EnvError> {
    let d = ServerConfig::default();
    Ok(ServerConfig {
        admin_host: env::var("VR_ADMIN_HOST").unwrap_or(d.admin_host),
        admin_port: parse_env_or("VR_ADMIN_PORT", d.admin_port)?
    })
}

fn parse_env<T>(key: &str) -> Result<Option<T>, EnvError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display
{
    match env::var(key) {
        Ok(s) => s.parse::<T>().map(Some).map_err(|e| EnvError {
            key: key.to_string(),
            value: s.clone(),
            reason: e.to_string()
        }),
        Err(_) => Ok(None)
    }
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, EnvError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display
{
    Ok(parse_env(key)?.unwrap_or(default))
}

//! # Configuration Structures
//!
//! All configuration structures for the voice relay.
//!
//! Every structure:
//! - Uses `serde` with per-field defaults, so partial files are valid
//! - Uses `validator` for range and consistency checks
//! - Implements `Default` with the documented production defaults

use relay_core::{AudioEncoding, CostTier, ProviderCapabilities, ProviderId, ProviderKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

/// Top-level configuration for the relay.
///
/// ## Usage
/// ```rust,no_run
/// use config::Config;
///
/// let config = Config::default();
/// println!("Breaker threshold: {}", config.breaker.failure_threshold);
/// ```
///
/// ## Sections
/// - `storage`: durable (PostgreSQL) and cache (Redis) tiers of the call store
/// - `breaker`: per-provider circuit breaker thresholds
/// - `reconnect`: provider connection reconnect and health settings
/// - `registry`: the configured AI providers and their capabilities
/// - `session`: orchestrator queue sizes and failover policy
/// - `observability`: logging and metrics
/// - `server`: admin surface bind address
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    #[validate(nested)]
    pub registry: RegistryConfig,

    #[serde(default)]
    #[validate(nested)]
    pub session: SessionConfig,

    #[serde(default)]
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct StorageConfig {
    /// Durable system of record
    #[serde(default)]
    #[validate(nested)]
    pub postgres: PostgresConfig,

    /// Fast volatile cache
    #[serde(default)]
    #[validate(nested)]
    pub redis: RedisConfig
}

/// PostgreSQL connection settings for the durable call-state tier.
///
/// ## Fields
/// - `host`: Database server hostname (default: "localhost")
/// - `port`: Database server port (default: 5432)
/// - `database`: Database name (default: "voice_relay")
/// - `username`: Database user (default: "postgres")
/// - `password`: Database password (default: "", set through `PG_PASSWORD`)
/// - `pool_size`: Maximum connections in pool (default: 10, range: 1-100)
/// - `timeout_seconds`: Connection timeout (default: 30, range: 1-300)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct PostgresConfig {
    #[serde(default = "default_postgres_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[serde(default = "default_postgres_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[serde(default = "default_postgres_database")]
    #[validate(length(min = 1, max = 63))]
    pub database: String,

    #[serde(default = "default_postgres_username")]
    #[validate(length(min = 1, max = 63))]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_postgres_pool_size")]
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,

    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "voice_relay".to_string()
}

fn default_postgres_username() -> String {
    "postgres".to_string()
}

fn default_postgres_pool_size() -> u32 {
    10
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_postgres_host(),
            port: default_postgres_port(),
            database: default_postgres_database(),
            username: default_postgres_username(),
            password: String::new(),
            pool_size: default_postgres_pool_size(),
            timeout_seconds: default_timeout_seconds()
        }
    }
}

impl PostgresConfig {
    pub fn connection_url(&self) -> String {
        if self.password.is_empty() {
            format!(
                "postgres://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            )
        } else {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            )
        }
    }
}

/// Redis settings for the fast call-state cache.
///
/// ## Fields
/// - `enabled`: Use the cache tier at all (default: true)
/// - `host`, `port`, `db`: server address (default: localhost:6379, db 0)
/// - `key_prefix`: namespace for relay keys (default: "relay")
/// - `entry_ttl_seconds`: expiry of cached call entries, a safety net for
///   entries whose call never ended cleanly (default: 86400)
/// - `timeout_seconds`: Connection timeout (default: 30, range: 1-300)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct RedisConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_redis_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    #[serde(default = "default_redis_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    #[serde(default)]
    #[validate(range(max = 15))]
    pub db: u8,

    #[serde(default = "default_redis_key_prefix")]
    #[validate(length(min = 1, max = 64))]
    pub key_prefix: String,

    #[serde(default = "default_redis_entry_ttl")]
    #[validate(range(min = 1))]
    pub entry_ttl_seconds: u64,

    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64
}

fn default_true() -> bool {
    true
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_key_prefix() -> String {
    "relay".to_string()
}

fn default_redis_entry_ttl() -> u64 {
    86_400
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            key_prefix: default_redis_key_prefix(),
            entry_ttl_seconds: default_redis_entry_ttl(),
            timeout_seconds: default_timeout_seconds()
        }
    }
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// Circuit breaker thresholds, shared by every provider's breaker.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the breaker
    #[serde(default = "default_success_threshold")]
    #[validate(range(min = 1))]
    pub success_threshold: u32,

    /// Time an open breaker waits before admitting a probe
    #[serde(default = "default_breaker_timeout")]
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,

    /// Concurrent probes admitted while half-open
    #[serde(default = "default_half_open_max_calls")]
    #[validate(range(min = 1))]
    pub half_open_max_calls: u32
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_seconds: default_breaker_timeout(),
            half_open_max_calls: default_half_open_max_calls()
        }
    }
}

/// Reconnect controller and health settings of a provider connection.
///
/// With the defaults the backoff schedule is 1, 2, 4, 8, 16 seconds.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,

    #[serde(default = "default_handshake_timeout")]
    #[validate(range(min = 1, max = 120))]
    pub handshake_timeout_seconds: u64,

    /// Silence after which the connection is flagged unhealthy
    #[serde(default = "default_stale_after")]
    #[validate(range(min = 1))]
    pub stale_after_seconds: u64,

    #[serde(default = "default_health_check_interval")]
    #[validate(range(min = 1))]
    pub health_check_interval_seconds: u64,

    #[serde(default = "default_replay_capacity")]
    #[validate(range(min = 1, max = 10000))]
    pub replay_buffer_capacity: usize,

    /// Upper bound on the extra wait inserted after a rate-limit signal
    #[serde(default = "default_rate_limit_wait")]
    pub rate_limit_wait_seconds: u64,

    #[serde(default = "default_command_queue_capacity")]
    #[validate(range(min = 1))]
    pub command_queue_capacity: usize
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_stale_after() -> u64 {
    15
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_replay_capacity() -> usize {
    100
}

fn default_rate_limit_wait() -> u64 {
    60
}

fn default_command_queue_capacity() -> usize {
    512
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            handshake_timeout_seconds: default_handshake_timeout(),
            stale_after_seconds: default_stale_after(),
            health_check_interval_seconds: default_health_check_interval(),
            replay_buffer_capacity: default_replay_capacity(),
            rate_limit_wait_seconds: default_rate_limit_wait(),
            command_queue_capacity: default_command_queue_capacity()
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    pub fn rate_limit_wait(&self) -> Duration {
        Duration::from_secs(self.rate_limit_wait_seconds)
    }
}

/// The configured AI providers.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
#[validate(schema(function = "validate_unique_provider_ids"))]
pub struct RegistryConfig {
    #[serde(default)]
    #[validate(nested)]
    pub providers: Vec<ProviderEntryConfig>
}

fn validate_unique_provider_ids(
    registry: &RegistryConfig,
) -> Result<(), validator::ValidationError> {
    let mut seen = HashSet::new();
    for provider in &registry.providers {
        if !seen.insert(provider.id.as_str()) {
            let mut err = validator::ValidationError::new("duplicate_provider_id");
            err.message = Some(format!("provider id '{}' declared twice", provider.id).into());
            return Err(err);
        }
    }
    Ok(())
}

/// One provider declaration.
///
/// ```toml
/// [[registry.providers]]
/// id = "openai-realtime"
/// endpoint = "wss://api.openai.com/v1/realtime"
/// model = "gpt-4o-realtime-preview"
/// kind = "realtime"
/// multimodal = true
/// function_calling = true
/// audio_encodings = ["pcm16", "mulaw"]
/// cost_tier = "premium"
/// priority = 10
/// rate_limit_aware = true
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProviderEntryConfig {
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    #[validate(length(min = 1))]
    pub endpoint: String,

    #[validate(length(min = 1))]
    pub model: String,

    pub kind: ProviderKind,

    #[serde(default)]
    pub multimodal: bool,

    #[serde(default)]
    pub function_calling: bool,

    #[validate(length(min = 1))]
    pub audio_encodings: Vec<AudioEncoding>,

    pub cost_tier: CostTier,

    #[serde(default)]
    pub priority: u32,

    /// Provider signals rate limiting and needs the extra pre-reconnect wait
    #[serde(default)]
    pub rate_limit_aware: bool,

    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool
}

impl ProviderEntryConfig {
    pub fn provider_id(&self) -> ProviderId {
        ProviderId::new(self.id.clone())
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            kind: self.kind,
            multimodal: self.multimodal,
            function_calling: self.function_calling,
            audio_encodings: self.audio_encodings.clone(),
            cost_tier: self.cost_tier,
            priority: self.priority
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct SessionConfig {
    /// Capacity of each connection's outbound event queue
    #[serde(default = "default_event_queue_capacity")]
    #[validate(range(min = 1))]
    pub event_queue_capacity: usize,

    /// Capacity of the audio queues between the telephony leg and the relay
    #[serde(default = "default_audio_queue_capacity")]
    #[validate(range(min = 1))]
    pub audio_queue_capacity: usize,

    #[serde(default = "default_true")]
    pub failover_enabled: bool,

    #[serde(default = "default_max_failovers")]
    pub max_failovers: u32
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_audio_queue_capacity() -> usize {
    256
}

fn default_max_failovers() -> u32 {
    2
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_event_queue_capacity(),
            audio_queue_capacity: default_audio_queue_capacity(),
            failover_enabled: true,
            max_failovers: default_max_failovers()
        }
    }
}

/// Logging and metrics.
///
/// ## Fields
/// - `metrics_enabled`: Install the Prometheus exporter (default: true)
/// - `metrics_port`: Exporter port (default: 9090)
/// - `logging_level`: Log level when `RUST_LOG` is unset (default: "info")
/// - `json_logs`: Emit JSON log lines (default: false)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ObservabilityConfig {
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,

    #[serde(default = "default_metrics_port")]
    #[validate(range(min = 1))]
    pub metrics_port: u16,

    #[serde(default = "default_logging_level")]
    #[validate(custom(function = "validate_logging_level"))]
    pub logging_level: String,

    #[serde(default)]
    pub json_logs: bool
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_logging_level() -> String {
    "info".to_string()
}

fn validate_logging_level(value: &str) -> Result<(), validator::ValidationError> {
    match value {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validator::ValidationError::new("Invalid logging level"))
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_port: default_metrics_port(),
            logging_level: default_logging_level(),
            json_logs: false
        }
    }
}

/// Bind address of the administrative HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_admin_host")]
    #[validate(length(min = 1, max = 255))]
    pub admin_host: String,

    #[serde(default = "default_admin_port")]
    #[validate(range(min = 1))]
    pub admin_port: u16
}

fn default_admin_host() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            admin_host: default_admin_host(),
            admin_port: default_admin_port()
        }
    }
}

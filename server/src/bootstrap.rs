//! Wiring of the store tiers and the provider registry from configuration.

use config::{Config, ProviderEntryConfig, StorageConfig};
use errors::{SelectionError, StorageError};
use providers::{JsonCodec, ProviderRegistry, TransportConnector, WebSocketConnector, WireCodec};
use std::sync::Arc;
use std::time::Duration;
use storage::{CallCache, CallStateStore, DurableCallStore, PostgresCallStore, RedisCallCache};
use tracing::{info, warn};

/// Connect both tiers. The durable tier is required; a cache tier that
/// cannot be reached leaves the store running durable-only.
pub async fn build_store(config: &StorageConfig) -> Result<CallStateStore, StorageError> {
    let postgres = PostgresCallStore::with_options(
        &config.postgres.connection_url(),
        config.postgres.pool_size,
        Duration::from_secs(config.postgres.timeout_seconds)
    )
    .await?;
    postgres.initialize_schema().await?;
    let durable: Arc<dyn DurableCallStore> = Arc::new(postgres);
    info!(host = %config.postgres.host, "Durable call store connected");

    if !config.redis.enabled {
        info!("Call cache disabled, running durable-only");
        return Ok(CallStateStore::durable_only(durable));
    }

    let ttl = Some(Duration::from_secs(config.redis.entry_ttl_seconds));
    match RedisCallCache::new(&config.redis.connection_url(), config.redis.key_prefix.clone(), ttl)
        .await
    {
        Ok(cache) => {
            info!(host = %config.redis.host, "Call cache connected");
            let cache: Arc<dyn CallCache> = Arc::new(cache);
            Ok(CallStateStore::new(durable, Some(cache)))
        }
        Err(e) => {
            warn!(error = %e, "Call cache unreachable, running durable-only");
            Ok(CallStateStore::durable_only(durable))
        }
    }
}

/// WebSocket connector for one declared provider, authenticated from the
/// environment variable named in its declaration.
pub fn websocket_connector(declared: &ProviderEntryConfig) -> Arc<dyn TransportConnector> {
    let codec: Arc<dyn WireCodec> = Arc::new(JsonCodec);
    let mut connector = WebSocketConnector::new(declared.endpoint.clone(), codec);

    if let Some(var) = &declared.api_key_env {
        match std::env::var(var) {
            Ok(key) if !key.is_empty() => connector = connector.with_api_key(key),
            _ => warn!(provider = %declared.id, env = %var, "API key variable not set")
        }
    }
    Arc::new(connector)
}

pub fn build_registry(config: &Config) -> Result<ProviderRegistry, SelectionError> {
    let registry = ProviderRegistry::from_config(
        &config.registry,
        &config.breaker,
        &config.reconnect,
        websocket_connector
    )?;

    if registry.is_empty() {
        warn!("No providers configured; every call will fail selection");
    }
    for entry in registry.providers() {
        info!(
            provider = %entry.id,
            kind = %entry.capabilities.kind,
            cost_tier = %entry.capabilities.cost_tier,
            enabled = entry.enabled,
            "Provider registered"
        );
    }
    Ok(registry)
}

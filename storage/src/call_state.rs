//! Dual-tier call-state store.
//!
//! Writes go to the durable tier first and then to the cache. Reads prefer
//! the cache and fall back to the durable tier, repopulating the cache on a
//! miss. The cache is advisory: any cache failure is logged, counted and
//! absorbed. Durable failures are returned for the specific operation.

use crate::backend::{CallCache, DurableCallStore};
use crate::telemetry::StoreTelemetry;
use chrono::Utc;
use errors::StorageError;
use relay_core::{CallState, CallStatus, InvalidTransition};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata key recording why a call ended.
pub const END_REASON_KEY: &str = "end_reason";

pub struct CallStateStore {
    durable: Arc<dyn DurableCallStore>,
    cache: Option<Arc<dyn CallCache>>,
    telemetry: StoreTelemetry
}

impl CallStateStore {
    pub fn new(durable: Arc<dyn DurableCallStore>, cache: Option<Arc<dyn CallCache>>) -> Self {
        Self {
            durable,
            cache,
            telemetry: StoreTelemetry
        }
    }

    /// Store without a cache tier; every read goes to the durable tier.
    pub fn durable_only(durable: Arc<dyn DurableCallStore>) -> Self {
        Self::new(durable, None)
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Persist a new call. Rejected when the call id already has an active
    /// record.
    pub async fn register_call(&self, call: CallState) -> Result<CallState, StorageError> {
        if call.status.is_terminal() {
            return Err(StorageError::TerminalStatus {
                call_id: call.call_id.clone(),
                status: call.status.to_string()
            });
        }

        self.durable_op("register_call", self.durable.insert(&call))
            .await?;
        self.cache_put("register_call", &call).await;

        info!(
            call_id = %call.call_id,
            session_id = %call.session_id,
            direction = %call.direction,
            "Call registered"
        );
        Ok(call)
    }

    /// Move an active call to `status`. A terminal status ends the call and
    /// evicts it from the cache, exactly like [`CallStateStore::end_call`].
    pub async fn update_call_status(
        &self,
        call_id: &str,
        status: CallStatus
    ) -> Result<CallState, StorageError> {
        if status.is_terminal() {
            return self.end_call(call_id, status, None).await;
        }

        let mut call = self.load_for_write(call_id).await?;
        let from = call.status;
        call.apply_status(status, Utc::now())
            .map_err(transition_error)?;

        self.durable_op("update_call_status", self.durable.update(&call))
            .await?;
        self.cache_put("update_call_status", &call).await;

        info!(call_id, from = %from, to = %status, "Call status changed");
        Ok(call)
    }

    /// Merge `entries` into the call's metadata map.
    pub async fn update_call_metadata(
        &self,
        call_id: &str,
        entries: HashMap<String, Value>
    ) -> Result<CallState, StorageError> {
        let mut call = self.load_for_write(call_id).await?;
        if !call.is_active() {
            return Err(StorageError::TerminalStatus {
                call_id: call_id.to_string(),
                status: call.status.to_string()
            });
        }

        call.metadata.extend(entries);
        call.updated_at = Utc::now();

        self.durable_op("update_call_metadata", self.durable.update(&call))
            .await?;
        self.cache_put("update_call_metadata", &call).await;
        Ok(call)
    }

    /// Mark the durable record terminal and evict the cache entry. The
    /// durable record is kept.
    pub async fn end_call(
        &self,
        call_id: &str,
        status: CallStatus,
        reason: Option<&str>
    ) -> Result<CallState, StorageError> {
        let mut call = self.load_for_write(call_id).await?;

        if !status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                call_id: call_id.to_string(),
                from: call.status.to_string(),
                to: status.to_string()
            });
        }

        call.apply_status(status, Utc::now())
            .map_err(transition_error)?;
        if let Some(reason) = reason {
            call.metadata
                .insert(END_REASON_KEY.to_string(), Value::String(reason.to_string()));
        }

        self.durable_op("end_call", self.durable.update(&call)).await?;
        self.cache_evict("end_call", &call).await;

        info!(
            call_id,
            session_id = %call.session_id,
            status = %status,
            reason = reason.unwrap_or(""),
            "Call ended"
        );
        Ok(call)
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<CallState>, StorageError> {
        if let Some(call) = self.cache_get("get_call", call_id).await {
            return Ok(Some(call));
        }

        let call = self.durable_op("get_call", self.durable.get(call_id)).await?;
        if let Some(call) = &call {
            self.refill("get_call", call).await;
        }
        Ok(call)
    }

    pub async fn get_call_by_session(
        &self,
        session_id: Uuid
    ) -> Result<Option<CallState>, StorageError> {
        if let Some(cache) = &self.cache {
            match cache.get_by_session(session_id).await {
                Ok(Some(call)) => return Ok(Some(call)),
                Ok(None) => {}
                Err(e) => self.degraded("get_call_by_session", cache.tier(), &e)
            }
        }

        let call = self
            .durable_op(
                "get_call_by_session",
                self.durable.get_by_session(session_id)
            )
            .await?;
        if let Some(call) = &call {
            self.refill("get_call_by_session", call).await;
        }
        Ok(call)
    }

    /// Every call in a non-terminal status, read from the durable tier.
    pub async fn list_active_calls(&self) -> Result<Vec<CallState>, StorageError> {
        self.durable_op(
            "list_active_calls",
            self.durable.list_by_status(&CallStatus::non_terminal())
        )
        .await
    }

    /// Repopulate the cache from the durable tier after a restart.
    pub async fn recover_active_calls(&self) -> Result<Vec<CallState>, StorageError> {
        let calls = self.list_active_calls().await?;

        for call in &calls {
            self.cache_put("recover_active_calls", call).await;
        }

        self.telemetry.record_recovered(calls.len());
        info!(count = calls.len(), "Recovered active calls");
        Ok(calls)
    }

    /// Mutations read the system of record so a cache entry that missed a
    /// write during an outage can never be written back.
    async fn load_for_write(&self, call_id: &str) -> Result<CallState, StorageError> {
        self.durable_op("load_for_write", self.durable.get(call_id))
            .await?
            .ok_or_else(|| StorageError::NotFound {
                backend: self.durable.tier().to_string(),
                id: call_id.to_string()
            })
    }

    /// Cache a record read from the durable tier after a miss. An `end_call`
    /// can land between that read and the put, so the durable record is
    /// checked again and the entry dropped once it is terminal.
    async fn refill(&self, operation: &str, call: &CallState) {
        if self.cache.is_none() || !call.is_active() {
            return;
        }
        self.cache_put(operation, call).await;

        match self.durable.get_by_session(call.session_id).await {
            Ok(Some(current)) if current.is_active() => {}
            Ok(_) => {
                debug!(call_id = %call.call_id, "Call ended during cache refill");
                self.cache_evict(operation, call).await;
            }
            Err(e) => {
                warn!(operation, error = %e, "Durable recheck after cache refill failed");
                self.cache_evict(operation, call).await;
            }
        }
    }

    async fn durable_op<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, StorageError>>
    ) -> Result<T, StorageError> {
        let start = Instant::now();
        let result = fut.await;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        self.telemetry
            .record_operation(operation, self.durable.tier(), result.is_ok(), elapsed);

        if let Err(e) = &result {
            warn!(operation, error = %e, "Durable call store operation failed");
        }
        result
    }

    async fn cache_get(&self, operation: &str, call_id: &str) -> Option<CallState> {
        let cache = self.cache.as_ref()?;
        let start = Instant::now();
        match cache.get(call_id).await {
            Ok(hit) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                self.telemetry
                    .record_operation(operation, cache.tier(), true, elapsed);
                if hit.is_none() {
                    debug!(call_id, "Call cache miss");
                }
                hit
            }
            Err(e) => {
                self.degraded(operation, cache.tier(), &e);
                None
            }
        }
    }

    async fn cache_put(&self, operation: &str, call: &CallState) {
        let Some(cache) = &self.cache else {
            return;
        };
        let start = Instant::now();
        match cache.put(call).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                self.telemetry
                    .record_operation(operation, cache.tier(), true, elapsed);
            }
            Err(e) => {
                self.degraded(operation, cache.tier(), &e);
                // A stale entry is worse than none.
                let _ = cache.evict(&call.call_id, call.session_id).await;
            }
        }
    }

    async fn cache_evict(&self, operation: &str, call: &CallState) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = cache.evict(&call.call_id, call.session_id).await {
            self.degraded(operation, cache.tier(), &e);
        }
    }

    fn degraded(&self, operation: &str, tier: &str, error: &StorageError) {
        self.telemetry.record_operation(operation, tier, false, 0.0);
        self.telemetry.record_cache_degraded(operation);
        warn!(
            operation,
            tier,
            error = %error,
            "Call cache unavailable, continuing with durable store only"
        );
    }
}

fn transition_error(e: InvalidTransition) -> StorageError {
    StorageError::InvalidTransition {
        call_id: e.call_id,
        from: e.from.to_string(),
        to: e.to.to_string()
    }
}

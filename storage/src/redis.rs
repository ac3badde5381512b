use crate::backend::CallCache;
use async_trait::async_trait;
use errors::StorageError;
use redis::AsyncCommands;
use relay_core::CallState;
use std::time::Duration;
use uuid::Uuid;

const BACKEND: &str = "Redis";

/// Redis cache tier.
///
/// Layout:
/// - `{prefix}:call:{call_id}`: JSON-encoded `CallState`
/// - `{prefix}:session:{session_id}`: the owning call id
///
/// Both keys carry the same expiry so an entry whose call never ended
/// cleanly ages out on its own.
pub struct RedisCallCache {
    connection_manager: redis::aio::ConnectionManager,
    key_prefix: String,
    entry_ttl: Option<Duration>
}

impl RedisCallCache {
    pub async fn new(
        connection_string: &str,
        key_prefix: impl Into<String>,
        entry_ttl: Option<Duration>
    ) -> Result<Self, StorageError> {
        let client =
            redis::Client::open(connection_string).map_err(|e| StorageError::ConnectionError {
                backend: BACKEND.to_string(),
                reason: e.to_string()
            })?;

        let connection_manager =
            client
                .get_connection_manager()
                .await
                .map_err(|e| StorageError::ConnectionError {
                    backend: BACKEND.to_string(),
                    reason: e.to_string()
                })?;

        Ok(Self {
            connection_manager,
            key_prefix: key_prefix.into(),
            entry_ttl
        })
    }

    fn call_key(&self, call_id: &str) -> String {
        format!("{}:call:{}", self.key_prefix, call_id)
    }

    fn session_key(&self, session_id: Uuid) -> String {
        format!("{}:session:{}", self.key_prefix, session_id)
    }

    async fn read_call(&self, key: &str) -> Result<Option<CallState>, StorageError> {
        let mut conn = self.connection_manager.clone();
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        raw.map(|json| serde_json::from_str(&json).map_err(StorageError::serialization))
            .transpose()
    }
}

#[async_trait]
impl CallCache for RedisCallCache {
    fn tier(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, call: &CallState) -> Result<(), StorageError> {
        let json = serde_json::to_string(call).map_err(StorageError::serialization)?;
        let call_key = self.call_key(&call.call_id);
        let session_key = self.session_key(call.session_id);

        let mut pipe = redis::pipe();
        pipe.atomic();
        match self.entry_ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                pipe.set_ex(&call_key, json, secs)
                    .ignore()
                    .set_ex(&session_key, &call.call_id, secs)
                    .ignore();
            }
            None => {
                pipe.set(&call_key, json)
                    .ignore()
                    .set(&session_key, &call.call_id)
                    .ignore();
            }
        }

        let mut conn = self.connection_manager.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError> {
        self.read_call(&self.call_key(call_id)).await
    }

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError> {
        let mut conn = self.connection_manager.clone();
        let call_id: Option<String> = conn
            .get(self.session_key(session_id))
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        match call_id {
            Some(call_id) => self.read_call(&self.call_key(&call_id)).await,
            None => Ok(None)
        }
    }

    async fn evict(&self, call_id: &str, session_id: Uuid) -> Result<(), StorageError> {
        let mut conn = self.connection_manager.clone();
        conn.del::<_, ()>(vec![self.call_key(call_id), self.session_key(session_id)])
            .await
            .map_err(|e| StorageError::query(BACKEND, e))
    }
}

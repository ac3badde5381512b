use crate::backend::DurableCallStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StorageError;
use relay_core::{CallDirection, CallState, CallStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{AssertSqlSafe, Row};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

const BACKEND: &str = "PostgreSQL";

const SELECT_COLUMNS: &str = "call_id, session_id, telephony_provider, direction, status, \
                              from_number, to_number, metadata, created_at, updated_at, ended_at";

/// Durable call-state tier.
///
/// One row per session. A partial unique index keeps at most one open
/// (non-ended) row per call id; ended rows are kept as the audit trail.
pub struct PostgresCallStore {
    pool: PgPool
}

impl PostgresCallStore {
    pub async fn new(connection_url: &str) -> Result<Self, StorageError> {
        Self::with_options(connection_url, 10, Duration::from_secs(30)).await
    }

    pub async fn with_options(
        connection_url: &str,
        max_connections: u32,
        acquire_timeout: Duration
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(connection_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                backend: BACKEND.to_string(),
                reason: e.to_string()
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> Result<(), StorageError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS call_states (
                session_id UUID PRIMARY KEY,
                call_id TEXT NOT NULL,
                telephony_provider TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL,
                from_number TEXT NOT NULL,
                to_number TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::query(BACKEND, e))?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_call_states_open_call
             ON call_states(call_id) WHERE ended_at IS NULL"
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::query(BACKEND, e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_call_states_status ON call_states(status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        Ok(())
    }

    fn row_to_call(row: &PgRow) -> Result<CallState, StorageError> {
        let decode = |e: sqlx::Error| StorageError::query(BACKEND, e);

        let direction: String = row.try_get("direction").map_err(decode)?;
        let status: String = row.try_get("status").map_err(decode)?;
        let metadata: serde_json::Value = row.try_get("metadata").map_err(decode)?;

        Ok(CallState {
            call_id: row.try_get("call_id").map_err(decode)?,
            session_id: row.try_get("session_id").map_err(decode)?,
            telephony_provider: row.try_get("telephony_provider").map_err(decode)?,
            direction: direction
                .parse::<CallDirection>()
                .map_err(|e| StorageError::serialization(format!("direction '{direction}': {e}")))?,
            status: status
                .parse::<CallStatus>()
                .map_err(|e| StorageError::serialization(format!("status '{status}': {e}")))?,
            from_number: row.try_get("from_number").map_err(decode)?,
            to_number: row.try_get("to_number").map_err(decode)?,
            metadata: serde_json::from_value::<HashMap<String, serde_json::Value>>(metadata)
                .map_err(StorageError::serialization)?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode)?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode)?,
            ended_at: row
                .try_get::<Option<DateTime<Utc>>, _>("ended_at")
                .map_err(decode)?
        })
    }
}

#[async_trait]
impl DurableCallStore for PostgresCallStore {
    fn tier(&self) -> &'static str {
        "postgres"
    }

    async fn insert(&self, call: &CallState) -> Result<(), StorageError> {
        let metadata = serde_json::to_value(&call.metadata).map_err(StorageError::serialization)?;

        let result = sqlx::query(
            "INSERT INTO call_states (session_id, call_id, telephony_provider, direction, status, \
             from_number, to_number, metadata, created_at, updated_at, ended_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        )
        .bind(call.session_id)
        .bind(&call.call_id)
        .bind(&call.telephony_provider)
        .bind(call.direction.as_ref())
        .bind(call.status.as_ref())
        .bind(&call.from_number)
        .bind(&call.to_number)
        .bind(metadata)
        .bind(call.created_at)
        .bind(call.updated_at)
        .bind(call.ended_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::AlreadyExists {
                    call_id: call.call_id.clone()
                })
            }
            Err(e) => Err(StorageError::query(BACKEND, e))
        }
    }

    async fn update(&self, call: &CallState) -> Result<(), StorageError> {
        let metadata = serde_json::to_value(&call.metadata).map_err(StorageError::serialization)?;

        let result = sqlx::query(
            "UPDATE call_states
             SET status = $2, metadata = $3, updated_at = $4, ended_at = $5
             WHERE session_id = $1"
        )
        .bind(call.session_id)
        .bind(call.status.as_ref())
        .bind(metadata)
        .bind(call.updated_at)
        .bind(call.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::query(BACKEND, e))?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                backend: BACKEND.to_string(),
                id: call.session_id.to_string()
            });
        }
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM call_states WHERE call_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(AssertSqlSafe(sql.as_str()))
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        row.as_ref().map(Self::row_to_call).transpose()
    }

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM call_states WHERE session_id = $1");
        let row = sqlx::query(AssertSqlSafe(sql.as_str()))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        row.as_ref().map(Self::row_to_call).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[CallStatus],
    ) -> Result<Vec<CallState>, StorageError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.to_string()).collect();

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM call_states WHERE status = ANY($1) ORDER BY created_at"
        );
        let rows = sqlx::query(AssertSqlSafe(sql.as_str()))
            .bind(statuses)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::query(BACKEND, e))?;

        rows.iter().map(Self::row_to_call).collect()
    }
}

//! Tier contracts of the call-state store.

use async_trait::async_trait;
use errors::StorageError;
use relay_core::{CallState, CallStatus};
use uuid::Uuid;

/// Fast, volatile lookup tier. Keyed by call id and reverse-indexed by
/// session id. Losing its contents must never lose information.
#[async_trait]
pub trait CallCache: Send + Sync {
    /// Short tier name used in logs and metric labels.
    fn tier(&self) -> &'static str;

    async fn put(&self, call: &CallState) -> Result<(), StorageError>;

    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError>;

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError>;

    /// Drop both the call entry and its session index entry.
    async fn evict(&self, call_id: &str, session_id: Uuid) -> Result<(), StorageError>;
}

/// System of record. Records are never deleted.
#[async_trait]
pub trait DurableCallStore: Send + Sync {
    fn tier(&self) -> &'static str;

    /// Fails with `AlreadyExists` when the call id already has a
    /// non-terminal record.
    async fn insert(&self, call: &CallState) -> Result<(), StorageError>;

    /// Replace the record identified by `call.session_id`.
    async fn update(&self, call: &CallState) -> Result<(), StorageError>;

    /// Most recent record for the call id.
    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError>;

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError>;

    async fn list_by_status(&self, statuses: &[CallStatus]) -> Result<Vec<CallState>, StorageError>;
}

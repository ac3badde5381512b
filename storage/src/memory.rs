//! In-process tiers backed by `DashMap`.
//!
//! Used in unit tests and for single-node deployments without Redis. Both
//! tiers can be switched offline to exercise the degraded paths.

use crate::backend::{CallCache, DurableCallStore};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use errors::StorageError;
use relay_core::{CallState, CallStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

fn offline(backend: &str) -> StorageError {
    StorageError::ConnectionError {
        backend: backend.to_string(),
        reason: "backend offline".to_string()
    }
}

#[derive(Debug)]
pub struct InMemoryCallCache {
    calls: DashMap<String, CallState>,
    sessions: DashMap<Uuid, String>,
    online: AtomicBool
}

impl Default for InMemoryCallCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCallCache {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
            sessions: DashMap::new(),
            online: AtomicBool::new(true)
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn contains(&self, call_id: &str) -> bool {
        self.calls.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline("memory-cache"))
        }
    }
}

#[async_trait]
impl CallCache for InMemoryCallCache {
    fn tier(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, call: &CallState) -> Result<(), StorageError> {
        self.check()?;
        self.sessions.insert(call.session_id, call.call_id.clone());
        self.calls.insert(call.call_id.clone(), call.clone());
        Ok(())
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError> {
        self.check()?;
        Ok(self.calls.get(call_id).map(|entry| entry.value().clone()))
    }

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError> {
        self.check()?;
        let Some(call_id) = self.sessions.get(&session_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(self.calls.get(&call_id).map(|entry| entry.value().clone()))
    }

    async fn evict(&self, call_id: &str, session_id: Uuid) -> Result<(), StorageError> {
        self.check()?;
        self.calls.remove(call_id);
        self.sessions.remove(&session_id);
        Ok(())
    }
}

/// Durable-tier stand-in. Records are keyed by session id; `latest` points
/// each call id at its most recent record.
#[derive(Debug)]
pub struct InMemoryCallStore {
    records: DashMap<Uuid, CallState>,
    latest: DashMap<String, Uuid>,
    online: AtomicBool
}

impl Default for InMemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            latest: DashMap::new(),
            online: AtomicBool::new(true)
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(offline("memory-store"))
        }
    }
}

#[async_trait]
impl DurableCallStore for InMemoryCallStore {
    fn tier(&self) -> &'static str {
        "memory"
    }

    async fn insert(&self, call: &CallState) -> Result<(), StorageError> {
        self.check()?;
        match self.latest.entry(call.call_id.clone()) {
            Entry::Occupied(mut entry) => {
                let active = self
                    .records
                    .get(entry.get())
                    .is_some_and(|existing| existing.is_active());
                if active {
                    return Err(StorageError::AlreadyExists {
                        call_id: call.call_id.clone()
                    });
                }
                entry.insert(call.session_id);
            }
            Entry::Vacant(entry) => {
                entry.insert(call.session_id);
            }
        }
        self.records.insert(call.session_id, call.clone());
        Ok(())
    }

    async fn update(&self, call: &CallState) -> Result<(), StorageError> {
        self.check()?;
        match self.records.get_mut(&call.session_id) {
            Some(mut record) => {
                *record = call.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                backend: "memory-store".to_string(),
                id: call.session_id.to_string()
            })
        }
    }

    async fn get(&self, call_id: &str) -> Result<Option<CallState>, StorageError> {
        self.check()?;
        let Some(session_id) = self.latest.get(call_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.records.get(&session_id).map(|r| r.value().clone()))
    }

    async fn get_by_session(&self, session_id: Uuid) -> Result<Option<CallState>, StorageError> {
        self.check()?;
        Ok(self.records.get(&session_id).map(|r| r.value().clone()))
    }

    async fn list_by_status(
        &self,
        statuses: &[CallStatus],
    ) -> Result<Vec<CallState>, StorageError> {
        self.check()?;
        let mut calls: Vec<CallState> = self
            .records
            .iter()
            .filter(|r| statuses.contains(&r.status))
            .map(|r| r.value().clone())
            .collect();
        calls.sort_by_key(|c| c.created_at);
        Ok(calls)
    }
}

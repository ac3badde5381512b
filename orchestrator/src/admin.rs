//! Operator control surface.
//!
//! Breaker inspection and overrides plus a view of active calls. Transport
//! agnostic; the server exposes it over HTTP.

use crate::session::{SessionOrchestrator, SessionStatus};
use errors::AdminError;
use providers::{BreakerSnapshot, CircuitBreaker};
use relay_core::CallState;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

/// An active call record and its live session, if this process holds one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCall {
    pub call: CallState,
    pub session: Option<SessionStatus>
}

#[derive(Debug, Clone)]
pub struct AdminApi {
    orchestrator: Arc<SessionOrchestrator>
}

impl AdminApi {
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn list_breakers(&self) -> Vec<BreakerSnapshot> {
        self.orchestrator
            .registry()
            .breakers()
            .iter()
            .map(|breaker| breaker.snapshot())
            .collect()
    }

    pub fn breaker_status(&self, name: &str) -> Result<BreakerSnapshot, AdminError> {
        Ok(self.breaker(name)?.snapshot())
    }

    pub fn reset_breaker(&self, name: &str) -> Result<BreakerSnapshot, AdminError> {
        let breaker = self.breaker(name)?;
        warn!(breaker = name, "Circuit breaker reset by operator");
        breaker.reset();
        Ok(breaker.snapshot())
    }

    /// Hold the breaker open until it is reset.
    pub fn force_open_breaker(&self, name: &str) -> Result<BreakerSnapshot, AdminError> {
        let breaker = self.breaker(name)?;
        breaker.force_open();
        Ok(breaker.snapshot())
    }

    pub async fn active_calls(&self) -> Result<Vec<ActiveCall>, AdminError> {
        let calls = self.orchestrator.store().list_active_calls().await?;
        Ok(calls
            .into_iter()
            .map(|call| {
                let session = self.orchestrator.status(&call.call_id);
                ActiveCall { call, session }
            })
            .collect())
    }

    fn breaker(&self, name: &str) -> Result<Arc<CircuitBreaker>, AdminError> {
        self.orchestrator
            .registry()
            .breaker(name)
            .ok_or_else(|| AdminError::UnknownBreaker {
                name: name.to_string()
            })
    }
}
